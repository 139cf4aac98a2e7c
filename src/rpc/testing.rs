//! Testing utilities
//!
//! [`MockAgent`] plays the agent side of a connection over in-memory pipes,
//! letting tests script exactly what arrives on the wire and inspect what the
//! client wrote.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, duplex};

use crate::io::StdioTransport;
use crate::rpc::message::JsonRpcMessage;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Scripted agent peer
pub struct MockAgent {
    /// Lines written by the client
    incoming: Lines<BufReader<DuplexStream>>,

    /// Bytes delivered to the client; `None` after [`MockAgent::hang_up`]
    outgoing: Option<DuplexStream>,
}

impl MockAgent {
    /// Create a client transport connected to a fresh mock agent
    pub fn pair() -> (StdioTransport, MockAgent) {
        let (client_read, agent_write) = duplex(PIPE_CAPACITY);
        let (agent_read, client_write) = duplex(PIPE_CAPACITY);

        let agent = MockAgent {
            incoming: BufReader::new(agent_read).lines(),
            outgoing: Some(agent_write),
        };
        (StdioTransport::new(client_read, client_write), agent)
    }

    /// Next message written by the client, `None` once it closed its side
    pub async fn recv(&mut self) -> Option<JsonRpcMessage> {
        loop {
            let line = self.incoming.next_line().await.ok()??;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).expect("client wrote invalid JSON"));
        }
    }

    /// Next message written by the client, as raw JSON
    pub async fn recv_value(&mut self) -> Value {
        let message = self.recv().await.expect("client closed the stream");
        serde_json::to_value(message).expect("message serializes")
    }

    /// Write one raw line (a newline is appended)
    pub async fn send_raw(&mut self, line: &str) {
        let writer = self.outgoing.as_mut().expect("agent already hung up");
        writer.write_all(line.as_bytes()).await.expect("write to client");
        writer.write_all(b"\n").await.expect("write to client");
    }

    /// Write one JSON value as a line
    pub async fn send_value(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    /// Close the agent's output, producing end-of-stream on the client
    pub fn hang_up(&mut self) {
        self.outgoing.take();
    }
}
