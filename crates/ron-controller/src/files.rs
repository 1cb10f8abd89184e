//! Controller-side file serving and response-file collection.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use ron_proto::{FileChunk, Message, Payload, PART_SIZE};

/// Normalize a wire path to a safe relative path.
pub(crate) fn clean_relative(name: &str) -> Option<PathBuf> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let mut cleaned = PathBuf::new();
    for component in trimmed.split('/') {
        match component {
            "" | "." => {}
            ".." => return None,
            part => cleaned.push(part),
        }
    }
    Some(cleaned)
}

/// Resolve a requested file: the client's subpath first, then global.
pub(crate) fn resolve(base: &Path, namespace: &str, name: &str) -> Option<PathBuf> {
    let rel = clean_relative(name)?;
    if !namespace.is_empty() {
        let scoped = base.join(namespace).join(&rel);
        if scoped.is_file() {
            return Some(scoped);
        }
    }
    let global = base.join(&rel);
    global.is_file().then_some(global)
}

/// Stream a file to a client in increasing-offset chunks; the last chunk
/// carries `eof`. A missing file answers with the error string instead.
pub(crate) async fn serve_request(
    base: PathBuf,
    namespace: String,
    uuid: String,
    request: FileChunk,
    out: mpsc::Sender<Message>,
) {
    use tokio::io::AsyncReadExt;

    let Some(path) = resolve(&base, &namespace, &request.name) else {
        let mut chunk = FileChunk::request(&request.name, request.id);
        chunk.error = format!("{}: no such file", request.name);
        let _ = out.send(Message::new(uuid, Payload::File(chunk))).await;
        return;
    };

    let metadata = match std::fs::metadata(&path) {
        Ok(metadata) => metadata,
        Err(e) => {
            let mut chunk = FileChunk::request(&request.name, request.id);
            chunk.error = e.to_string();
            let _ = out.send(Message::new(uuid, Payload::File(chunk))).await;
            return;
        }
    };
    let perm = permission_bits(&metadata);
    let size = metadata.len();

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            let mut chunk = FileChunk::request(&request.name, request.id);
            chunk.error = e.to_string();
            let _ = out.send(Message::new(uuid, Payload::File(chunk))).await;
            return;
        }
    };

    let mut offset = 0u64;
    loop {
        let remaining = (size - offset).min(PART_SIZE as u64) as usize;
        let mut data = vec![0u8; remaining];
        if remaining > 0 {
            if let Err(e) = file.read_exact(&mut data).await {
                tracing::warn!(file = %request.name, "file serve: {e}");
                break;
            }
        }
        let eof = offset + remaining as u64 >= size;
        let chunk = FileChunk {
            name: request.name.clone(),
            offset,
            data,
            perm,
            eof,
            id: request.id,
            error: String::new(),
        };
        if out
            .send(Message::new(uuid.clone(), Payload::File(chunk)))
            .await
            .is_err()
        {
            break;
        }
        offset += remaining as u64;
        if eof {
            break;
        }
    }
}

/// Write a chunk received from an agent into its response directory at
/// the declared offset.
pub(crate) fn write_client_chunk(
    base: &Path,
    namespace: &str,
    uuid: &str,
    chunk: &FileChunk,
) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    let rel = clean_relative(&chunk.name)
        .ok_or_else(|| std::io::Error::other(format!("bad path {}", chunk.name)))?;
    let dir = response_dir(base, namespace, chunk.id, uuid);
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&path)?;
    file.seek(SeekFrom::Start(chunk.offset))?;
    file.write_all(&chunk.data)?;
    if chunk.eof {
        set_perm(&path, chunk.perm);
    }
    Ok(())
}

/// `<base>/<namespace>/miniccc_responses/<id>/<uuid>/`
pub(crate) fn response_dir(base: &Path, namespace: &str, id: u64, uuid: &str) -> PathBuf {
    let mut dir = base.to_path_buf();
    if !namespace.is_empty() {
        dir = dir.join(namespace);
    }
    dir.join("miniccc_responses").join(id.to_string()).join(uuid)
}

#[cfg(unix)]
pub(crate) fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn permission_bits(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_perm(path: &Path, perm: u32) {
    use std::os::unix::fs::PermissionsExt;
    if perm != 0 {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(perm));
    }
}

#[cfg(not(unix))]
fn set_perm(_path: &Path, _perm: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subpath_shadows_global() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ns")).unwrap();
        std::fs::write(dir.path().join("tool"), b"global").unwrap();
        std::fs::write(dir.path().join("ns/tool"), b"scoped").unwrap();

        let scoped = resolve(dir.path(), "ns", "tool").unwrap();
        assert_eq!(std::fs::read(scoped).unwrap(), b"scoped");

        let global = resolve(dir.path(), "other", "tool").unwrap();
        assert_eq!(std::fs::read(global).unwrap(), b"global");

        assert!(resolve(dir.path(), "ns", "missing").is_none());
        assert!(resolve(dir.path(), "ns", "../escape").is_none());
    }

    #[test]
    fn client_chunks_land_at_declared_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileChunk {
            name: "out/result.bin".into(),
            offset: 0,
            data: b"hello ".to_vec(),
            perm: 0o600,
            eof: false,
            id: 4,
            error: String::new(),
        };
        let second = FileChunk {
            name: "out/result.bin".into(),
            offset: 6,
            data: b"world".to_vec(),
            perm: 0o600,
            eof: true,
            id: 4,
            error: String::new(),
        };
        write_client_chunk(dir.path(), "", "aaaa", &first).unwrap();
        write_client_chunk(dir.path(), "", "aaaa", &second).unwrap();

        let path = response_dir(dir.path(), "", 4, "aaaa").join("out/result.bin");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }
}
