use stalker_remote::config::SessionConfig;
use stalker_remote::remote::packet;
use stalker_remote::remote::transport::TcpTransport;
use stalker_remote::remote::{EventHook, RemoteTarget, TargetKind, ThreadId};
use std::io::{BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Client side of `qSupported` with default configuration.
pub const SUPPORTED: &str = "qSupported:multiprocess+;swbreak+;hwbreak+;fork-events+;vfork-events+;exec-events+;vContSupported+;QThreadEvents+;no-resumed+";

/// Request string for an interrupt byte.
pub const INTERRUPT: &str = "\u{3}";

/// Exchanges expected by a scripted stub.
#[derive(Default)]
pub struct StubScript {
    steps: Vec<(String, Vec<u8>)>,
}

impl StubScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect `request`, answer with `replies` packets. A `%` prefix makes a notification.
    pub fn expect(self, request: &str, replies: &[&str]) -> Self {
        let raw = replies
            .iter()
            .flat_map(|reply| match reply.strip_prefix('%') {
                Some(n) => packet::encode_notification(n.as_bytes()),
                None => packet::encode(reply.as_bytes()),
            })
            .collect::<Vec<_>>();
        self.expect_raw(request, &raw)
    }

    /// Expect `request`, answer with raw bytes.
    pub fn expect_raw(mut self, request: &str, raw: &[u8]) -> Self {
        self.steps.push((request.to_string(), raw.to_vec()));
        self
    }
}

/// Stub thread listening on a loopback port.
pub struct ScriptedStub {
    pub addr: String,
    handle: JoinHandle<Vec<String>>,
}

impl ScriptedStub {
    /// Start a stub. It serves one connection and runs until the client disconnects.
    pub fn spawn(script: StubScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            serve(conn, script)
        });
        Self { addr, handle }
    }

    /// Wait for the client to disconnect, return received requests.
    pub fn join(self) -> Vec<String> {
        self.handle.join().expect("stub failed")
    }
}

fn serve(conn: TcpStream, script: StubScript) -> Vec<String> {
    let mut writer = conn.try_clone().unwrap();
    let mut reader = BufReader::new(conn);
    let mut steps = script.steps.into_iter();
    let mut requests = vec![];
    let mut ack_mode = true;

    let mut next_byte = || {
        let mut b = [0u8];
        match reader.read(&mut b) {
            Ok(1) => Some(b[0]),
            _ => None,
        }
    };

    while let Some(b) = next_byte() {
        let request = match b {
            b'+' | b'-' => continue,
            0x03 => INTERRUPT.to_string(),
            b'$' => {
                let mut payload = vec![];
                loop {
                    match next_byte() {
                        Some(b'#') => break,
                        Some(b) => payload.push(b),
                        None => return requests,
                    }
                }
                let hi = next_byte();
                let lo = next_byte();
                assert!(hi.is_some() && lo.is_some(), "truncated packet");
                if ack_mode {
                    writer.write_all(b"+").unwrap();
                }
                String::from_utf8_lossy(&payload).into_owned()
            }
            other => panic!("stub: unexpected byte {other:#x}"),
        };

        let (expected, reply) = steps
            .next()
            .unwrap_or_else(|| panic!("stub: unexpected request `{request}`"));
        assert_eq!(expected, request, "stub: request mismatch");
        writer.write_all(&reply).unwrap();
        if request == "QStartNoAckMode" {
            ack_mode = false;
        }
        requests.push(request);
    }
    assert!(steps.next().is_none(), "stub: client left before the script end");
    requests
}

/// Events seen by a hook.
#[derive(Clone, Default)]
pub struct TestHook {
    pub console: Arc<Mutex<String>>,
    pub threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl EventHook for TestHook {
    fn on_new_thread(&self, ptid: ThreadId) {
        self.threads.lock().unwrap().push(ptid);
    }

    fn on_console_output(&self, text: &str) {
        self.console.lock().unwrap().push_str(text);
    }
}

pub fn connect(
    stub: &ScriptedStub,
    kind: TargetKind,
    config: SessionConfig,
    hook: &TestHook,
) -> RemoteTarget {
    let transport = TcpTransport::connect(&stub.addr, config.interrupt_poll()).unwrap();
    RemoteTarget::connect(kind, Box::new(transport), config, Box::new(hook.clone())).unwrap()
}
