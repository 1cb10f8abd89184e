//! Controller–agent scenarios over localhost TCP: exec, once, filters,
//! file movement, and tunnels, with a real agent on the other end.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use ron_agent::{Agent, AgentConfig};
use ron_controller::{Controller, ControllerConfig, PermissiveCatalog};
use ron_plumb::Plumber;
use ron_proto::{Command, Filter};

const UUID_A: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
const UUID_B: &str = "bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb";

struct Rig {
    controller: Arc<Controller>,
    base: tempfile::TempDir,
    port: u16,
    agents: Vec<(Arc<Agent>, tempfile::TempDir)>,
}

async fn rig() -> Rig {
    let base = tempfile::TempDir::new().unwrap();
    let controller = Controller::start(
        ControllerConfig::new(base.path()).heartbeat_period(Duration::from_millis(150)),
        Arc::new(PermissiveCatalog),
        Plumber::local("controller"),
    )
    .unwrap();
    let port = controller.listen_tcp(0).await.unwrap();
    Rig {
        controller,
        base,
        port,
        agents: Vec::new(),
    }
}

impl Rig {
    async fn connect_agent(&mut self, uuid: &str) -> Arc<Agent> {
        let dir = tempfile::TempDir::new().unwrap();
        let config = AgentConfig::new("127.0.0.1", self.port)
            .uuid(uuid)
            .base(dir.path())
            .heartbeat_rate(Duration::from_millis(200))
            .dial_budget(20, Duration::from_millis(250));
        let agent = Agent::new(config).unwrap();
        tokio::spawn(agent.clone().run());
        self.agents.push((agent.clone(), dir));

        let want = uuid.to_string();
        self.wait_for(
            || {
                self.controller
                    .clients()
                    .iter()
                    .any(|snapshot| snapshot.uuid == want)
            },
            "agent connect",
        )
        .await;
        agent
    }

    async fn wait_for<F: FnMut() -> bool>(&self, mut check: F, what: &str) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn agent_base(&self, index: usize) -> &Path {
        self.agents[index].1.path()
    }

    fn response_path(&self, id: u64, uuid: &str, file: &str) -> PathBuf {
        self.base
            .path()
            .join("miniccc_responses")
            .join(id.to_string())
            .join(uuid)
            .join(file)
    }
}

#[tokio::test]
async fn exec_round_trip_materializes_response() {
    let mut rig = rig().await;
    rig.connect_agent(UUID_A).await;

    let id = rig
        .controller
        .new_command(Command::exec(vec!["echo".into(), "hello".into()]))
        .await;

    let stdout = rig.response_path(id, UUID_A, "stdout");
    rig.wait_for(|| stdout.exists(), "response files").await;

    assert_eq!(std::fs::read_to_string(&stdout).unwrap(), "hello\n");
    assert_eq!(
        std::fs::read_to_string(rig.response_path(id, UUID_A, "exitcode")).unwrap(),
        "0"
    );
    let command = rig.controller.command(id).unwrap();
    assert_eq!(command.checked_in, vec![UUID_A.to_string()]);

    rig.controller.destroy().await;
}

#[tokio::test]
async fn once_command_reaches_exactly_one_agent() {
    let mut rig = rig().await;
    rig.connect_agent(UUID_A).await;
    rig.connect_agent(UUID_B).await;

    let mut command = Command::exec(vec!["true".into()]);
    command.once = true;
    let id = rig.controller.new_command(command).await;

    rig.wait_for(
        || {
            rig.controller
                .command(id)
                .map(|c| c.checked_in.len() == 1)
                .unwrap_or(false)
        },
        "single check-in",
    )
    .await;

    // Give the other agent several heartbeats to (wrongly) observe it.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let command = rig.controller.command(id).unwrap();
    assert_eq!(command.checked_in.len(), 1);
    assert!(command.sent);

    rig.controller.destroy().await;
}

#[tokio::test]
async fn tag_filter_selects_one_agent() {
    let mut rig = rig().await;
    let edge = rig.connect_agent(UUID_A).await;
    rig.connect_agent(UUID_B).await;

    edge.set_tag("role", "edge");
    rig.wait_for(
        || {
            rig.controller.clients().iter().any(|snapshot| {
                snapshot.uuid == UUID_A
                    && snapshot.tags.get("role").map(String::as_str) == Some("edge")
            })
        },
        "tag to arrive",
    )
    .await;

    let mut command = Command::exec(vec!["echo".into(), "x".into()]);
    command.filter = Some(Filter {
        tags: [("role".to_string(), "edge".to_string())].into(),
        ..Default::default()
    });
    let id = rig.controller.new_command(command).await;

    let stdout = rig.response_path(id, UUID_A, "stdout");
    rig.wait_for(|| stdout.exists(), "filtered response").await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    let command = rig.controller.command(id).unwrap();
    assert_eq!(command.checked_in, vec![UUID_A.to_string()]);
    assert!(!rig
        .response_path(id, UUID_B, "stdout")
        .parent()
        .unwrap()
        .exists());

    rig.controller.destroy().await;
}

#[tokio::test]
async fn files_move_both_directions() {
    let mut rig = rig().await;
    rig.connect_agent(UUID_A).await;

    // Controller → agent.
    std::fs::write(rig.base.path().join("payload.txt"), b"drop me").unwrap();
    let mut push = Command::default();
    push.files_send = vec![ron_proto::SendFile {
        name: "payload.txt".into(),
        perm: 0o644,
    }];
    rig.controller.new_command(push).await;

    let delivered = rig.agent_base(0).join("files/payload.txt");
    rig.wait_for(|| delivered.exists(), "file delivery").await;
    assert_eq!(std::fs::read(&delivered).unwrap(), b"drop me");

    // Agent → controller.
    std::fs::write(rig.agent_base(0).join("report.txt"), b"found this").unwrap();
    let mut pull = Command::default();
    pull.files_recv = vec!["report.txt".into()];
    let id = rig.controller.new_command(pull).await;

    let collected = rig.response_path(id, UUID_A, "report.txt");
    rig.wait_for(|| collected.exists(), "file collection").await;
    assert_eq!(std::fs::read(&collected).unwrap(), b"found this");

    rig.controller.destroy().await;
}

#[tokio::test]
async fn tunnel_forward_bridges_tcp() {
    let mut rig = rig().await;
    rig.connect_agent(UUID_A).await;

    // Echo service on the "agent side".
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 5];
                if socket.read_exact(&mut buf).await.is_ok() && &buf == b"hello" {
                    let _ = socket.write_all(b"world").await;
                }
            });
        }
    });

    let bound = rig
        .controller
        .tunnel_forward(UUID_A, 0, "127.0.0.1", echo_port)
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", bound)).await.unwrap();
    client.write_all(b"hello").await.unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"world");

    rig.controller.destroy().await;
}

#[tokio::test]
async fn checkpoint_waits_for_all_agents() {
    let mut rig = rig().await;
    rig.connect_agent(UUID_A).await;
    rig.connect_agent(UUID_B).await;

    rig.controller
        .checkpoint(Duration::from_secs(10))
        .await
        .unwrap();

    rig.controller.destroy().await;
}

#[tokio::test]
async fn delete_command_restores_prior_state() {
    let mut rig = rig().await;
    rig.connect_agent(UUID_A).await;

    let id = rig
        .controller
        .new_command(Command::exec(vec!["true".into()]))
        .await;
    rig.wait_for(
        || {
            rig.controller
                .command(id)
                .map(|c| !c.checked_in.is_empty())
                .unwrap_or(false)
        },
        "ack",
    )
    .await;

    assert!(rig.controller.delete_command(id));
    assert!(rig.controller.commands().is_empty());
    assert!(!rig.controller.delete_command(id));

    rig.controller.destroy().await;
}
