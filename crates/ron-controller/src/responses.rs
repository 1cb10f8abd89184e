//! The single drain task for agent check-ins and command responses.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use ron_proto::{ClientSnapshot, Response};

use crate::{files, Controller};

/// One queued check-in: (controller-side uuid, namespace, snapshot).
pub(crate) type CheckIn = (String, String, ClientSnapshot);

pub(crate) async fn drain(controller: Arc<Controller>, mut rx: mpsc::Receiver<CheckIn>) {
    while let Some((uuid, namespace, snapshot)) = rx.recv().await {
        for (key, value) in &snapshot.tags {
            controller.catalog.set_tag(&uuid, key, value);
        }
        for response in &snapshot.responses {
            controller
                .commands
                .lock()
                .unwrap()
                .check_in(response.id, &uuid);
            // Responses keep materializing even for deleted commands.
            if let Err(e) = write_response(&controller.config.base, &namespace, &uuid, response)
            {
                tracing::warn!(uuid, id = response.id, "response write: {e}");
            }
        }
    }
}

/// Materialize `exitcode`, `stdout`, and `stderr` files; empty fields
/// are skipped, the exit code is written whenever it was recorded.
fn write_response(
    base: &Path,
    namespace: &str,
    uuid: &str,
    response: &Response,
) -> std::io::Result<()> {
    let dir = files::response_dir(base, namespace, response.id, uuid);
    std::fs::create_dir_all(&dir)?;
    if response.record_exit_code {
        std::fs::write(dir.join("exitcode"), response.exit_code.to_string())?;
    }
    if !response.stdout.is_empty() {
        std::fs::write(dir.join("stdout"), &response.stdout)?;
    }
    if !response.stderr.is_empty() {
        std::fs::write(dir.join("stderr"), &response.stderr)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_only_recorded_fields() {
        let dir = tempfile::tempdir().unwrap();
        let response = Response {
            id: 1,
            stdout: "hello\n".into(),
            stderr: String::new(),
            exit_code: 0,
            record_exit_code: true,
        };
        write_response(dir.path(), "", "aaaa", &response).unwrap();

        let out = files::response_dir(dir.path(), "", 1, "aaaa");
        assert_eq!(std::fs::read_to_string(out.join("stdout")).unwrap(), "hello\n");
        assert_eq!(std::fs::read_to_string(out.join("exitcode")).unwrap(), "0");
        assert!(!out.join("stderr").exists());
    }

    #[test]
    fn background_response_skips_exitcode() {
        let dir = tempfile::tempdir().unwrap();
        let response = Response {
            id: 2,
            record_exit_code: false,
            ..Default::default()
        };
        write_response(dir.path(), "ns", "aaaa", &response).unwrap();
        let out = files::response_dir(dir.path(), "ns", 2, "aaaa");
        assert!(out.exists());
        assert!(!out.join("exitcode").exists());
    }
}
