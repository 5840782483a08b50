//! Shared helpers for integration tests: an in-process server on ephemeral
//! ports and a framed test connection speaking the wire protocol.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use batchd::config::ServerConfig;
use batchd::protocol::{commands as cmd, FieldId, Item, Message, WireCodec};
use batchd::server::Server;
use batchd::state::QueueFlags;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub client_addr: SocketAddr,
    pub agent_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<batchd::error::Result<()>>,
}

impl TestServer {
    /// Start a server over `state_dir` on ephemeral ports, with tight timer
    /// intervals so tests do not wait on production frequencies.
    pub async fn start(state_dir: &Path) -> TestServer {
        let config = ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            state_dir.to_path_buf(),
        )
        .with_sched_freq(50);

        let shutdown = CancellationToken::new();
        let server = Server::start(config, shutdown.clone())
            .await
            .expect("server should start");
        let client_addr = server.client_addr();
        let agent_addr = server.agent_addr();
        let handle = tokio::spawn(server.run());

        TestServer {
            client_addr,
            agent_addr,
            shutdown,
            handle,
        }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("server task should not panic")
            .expect("server should stop cleanly");
    }
}

/// A client or agent connection framed with the wire codec.
pub struct TestConn {
    framed: Framed<TcpStream, WireCodec>,
}

impl TestConn {
    pub async fn connect(addr: SocketAddr) -> TestConn {
        let stream = TcpStream::connect(addr).await.expect("connect");
        TestConn {
            framed: Framed::new(stream, WireCodec),
        }
    }

    pub async fn send(&mut self, msg: Message) {
        self.framed.send(msg).await.expect("send frame");
    }

    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed unexpectedly")
            .expect("received a malformed frame")
    }

    /// Send a request and wait for its reply.
    pub async fn request(&mut self, msg: Message) -> Message {
        self.send(msg).await;
        self.recv().await
    }
}

/// Connect an agent and log it in for `node`.
pub async fn login_agent(server: &TestServer, node: &str) -> TestConn {
    let mut agent = TestConn::connect(server.agent_addr).await;
    let mut item = Item::new();
    item.set_str(FieldId::Node, node);
    agent.send(Message::with_item(cmd::AGENT_LOGIN, item)).await;
    agent
}

/// Add an OPEN and STARTED queue on `node` with the given job limit.
pub async fn add_queue(client: &mut TestConn, name: &str, node: &str, limit: i64) {
    let mut item = Item::new();
    item.set_str(FieldId::QueueName, name);
    item.set_str(FieldId::Node, node);
    item.set_int(FieldId::JobLimit, limit);
    item.set_int(
        FieldId::State,
        (QueueFlags::OPEN.bits() | QueueFlags::STARTED.bits()) as i64,
    );
    let reply = client.request(Message::with_item(cmd::ADD_QUEUE, item)).await;
    assert!(!reply.is_error(), "add_queue failed: {:?}", reply.error);
}

/// Submit a job and return its assigned id.
pub async fn submit_job(client: &mut TestConn, queue: &str, resources: &[&str]) -> u64 {
    let mut item = Item::new();
    item.set_str(FieldId::JobName, "it-job");
    item.set_str(FieldId::QueueName, queue);
    if !resources.is_empty() {
        item.set_array(
            FieldId::Resources,
            resources.iter().map(|r| r.to_string()).collect(),
        );
    }
    let reply = client.request(Message::with_item(cmd::ADD_JOB, item)).await;
    assert!(!reply.is_error(), "add_job failed: {:?}", reply.error);
    reply.item().unwrap().get_int(FieldId::JobId).unwrap() as u64
}

/// Report a job finished with the given exit code.
pub async fn report_completed(agent: &mut TestConn, job_id: u64, exit_code: i64) {
    let mut item = Item::new();
    item.set_int(FieldId::JobId, job_id as i64);
    item.set_int(FieldId::ExitCode, exit_code);
    agent.send(Message::with_item(cmd::JOB_COMPLETED, item)).await;
}
