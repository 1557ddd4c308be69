//! Breakpoint and watchpoint insertion (`Z`) and removal (`z`).

use crate::remote::error::Error;
use crate::remote::feature::Feature;
use crate::remote::packet::hex_encode;
use crate::remote::session::Session;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    Software,
    Hardware,
    WriteWatchpoint,
    ReadWatchpoint,
    AccessWatchpoint,
}

impl BreakpointKind {
    /// Type number in `Z`/`z` packets.
    pub fn code(self) -> u8 {
        match self {
            BreakpointKind::Software => 0,
            BreakpointKind::Hardware => 1,
            BreakpointKind::WriteWatchpoint => 2,
            BreakpointKind::ReadWatchpoint => 3,
            BreakpointKind::AccessWatchpoint => 4,
        }
    }

    fn feature(self) -> Feature {
        match self {
            BreakpointKind::Software => Feature::SwBreakpoint,
            BreakpointKind::Hardware => Feature::HwBreakpoint,
            BreakpointKind::WriteWatchpoint => Feature::WriteWatchpoint,
            BreakpointKind::ReadWatchpoint => Feature::ReadWatchpoint,
            BreakpointKind::AccessWatchpoint => Feature::AccessWatchpoint,
        }
    }

    pub fn is_watchpoint(self) -> bool {
        self.code() >= 2
    }
}

/// Breakpoint placement request.
///
/// Conditions and commands are agent expression bytecode, compiled elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub kind: BreakpointKind,
    pub addr: u64,
    /// Breakpoint kind for software/hardware breakpoints (usually instruction length),
    /// watched region length for watchpoints.
    pub len: usize,
    pub conditions: Vec<Vec<u8>>,
    pub commands: Vec<Vec<u8>>,
    /// Commands stay on the target after disconnect.
    pub persist: bool,
}

impl Breakpoint {
    pub fn new(kind: BreakpointKind, addr: u64, len: usize) -> Self {
        Self {
            kind,
            addr,
            len,
            conditions: vec![],
            commands: vec![],
            persist: false,
        }
    }

    pub fn with_condition(mut self, bytecode: Vec<u8>) -> Self {
        self.conditions.push(bytecode);
        self
    }

    pub fn with_command(mut self, bytecode: Vec<u8>, persist: bool) -> Self {
        self.commands.push(bytecode);
        self.persist = persist;
        self
    }
}

fn push_bytecode(buf: &mut String, bytecode: &[u8]) {
    _ = write!(buf, "X{:x},{}", bytecode.len(), hex_encode(bytecode));
}

impl Session {
    fn breakpoint_header(prefix: char, kind: BreakpointKind, addr: u64, len: usize) -> String {
        format!("{prefix}{},{addr:x},{len:x}", kind.code())
    }

    /// Insert breakpoint or watchpoint. Conditions and commands are sent only if the
    /// target evaluates them, otherwise they are left to the caller.
    ///
    /// Return `true` if conditions were handed to the target.
    pub fn insert_breakpoint(&mut self, bp: &Breakpoint) -> Result<bool, Error> {
        let mut request = Self::breakpoint_header('Z', bp.kind, bp.addr, bp.len);

        let target_conditions = !bp.conditions.is_empty()
            && self
                .features()
                .is_enabled(Feature::ConditionalBreakpoints);
        if target_conditions {
            request.push(';');
            for cond in &bp.conditions {
                push_bytecode(&mut request, cond);
            }
        }

        if !bp.commands.is_empty() && self.features().is_enabled(Feature::BreakpointCommands) {
            _ = write!(request, ";cmds:{:x},", u8::from(bp.persist));
            for cmd in &bp.commands {
                push_bytecode(&mut request, cmd);
            }
        }

        self.request_ok(bp.kind.feature(), request.as_bytes())?;
        Ok(target_conditions)
    }

    pub fn remove_breakpoint(
        &mut self,
        kind: BreakpointKind,
        addr: u64,
        len: usize,
    ) -> Result<(), Error> {
        let request = Self::breakpoint_header('z', kind, addr, len);
        self.request_ok(kind.feature(), request.as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::SessionConfig;
    use crate::remote::error::RemoteError;
    use crate::remote::feature::Support;
    use crate::remote::testing::FakeStub;

    fn session(stub: &FakeStub) -> Session {
        let mut session = Session::new(Box::new(stub.clone()), SessionConfig::default());
        session.set_ack_mode(false);
        session
    }

    #[test]
    fn test_insert_remove() {
        struct TestCase {
            bp: Breakpoint,
            insert: &'static str,
            remove: &'static str,
        }
        let test_cases = vec![
            TestCase {
                bp: Breakpoint::new(BreakpointKind::Software, 0x401000, 1),
                insert: "Z0,401000,1",
                remove: "z0,401000,1",
            },
            TestCase {
                bp: Breakpoint::new(BreakpointKind::Hardware, 0x401000, 4),
                insert: "Z1,401000,4",
                remove: "z1,401000,4",
            },
            TestCase {
                bp: Breakpoint::new(BreakpointKind::AccessWatchpoint, 0x7ffe0010, 8),
                insert: "Z4,7ffe0010,8",
                remove: "z4,7ffe0010,8",
            },
        ];

        for tc in test_cases {
            let stub = FakeStub::default();
            stub.expect(tc.insert, &["OK"]).expect(tc.remove, &["OK"]);
            let mut session = session(&stub);

            assert!(!session.insert_breakpoint(&tc.bp).unwrap());
            session
                .remove_breakpoint(tc.bp.kind, tc.bp.addr, tc.bp.len)
                .unwrap();
            assert!(stub.script_done(), "{}", tc.insert);
        }
    }

    #[test]
    fn test_conditions_and_commands() {
        let stub = FakeStub::default();
        stub.expect("Z0,1000,1;X2,2201X1,27;cmds:1,X3,0a0b0c", &["OK"])
            .expect("Z0,2000,1", &["OK"]);
        let mut session = session(&stub);
        session
            .features_mut()
            .observe(Feature::ConditionalBreakpoints, Support::Enabled);
        session
            .features_mut()
            .observe(Feature::BreakpointCommands, Support::Enabled);

        let bp = Breakpoint::new(BreakpointKind::Software, 0x1000, 1)
            .with_condition(vec![0x22, 0x01])
            .with_condition(vec![0x27])
            .with_command(vec![0x0a, 0x0b, 0x0c], true);
        assert!(session.insert_breakpoint(&bp).unwrap());

        // target side evaluation is not available, condition stays on the client
        session
            .features_mut()
            .observe(Feature::ConditionalBreakpoints, Support::Disabled);
        session
            .features_mut()
            .observe(Feature::BreakpointCommands, Support::Disabled);
        let bp = Breakpoint::new(BreakpointKind::Software, 0x2000, 1).with_condition(vec![0x27]);
        assert!(!session.insert_breakpoint(&bp).unwrap());
    }

    #[test]
    fn test_unsupported_kind() {
        let stub = FakeStub::default();
        stub.expect("Z1,1000,1", &[""]).expect("Z2,3000,4", &["E16"]);
        let mut session = session(&stub);

        let hw = Breakpoint::new(BreakpointKind::Hardware, 0x1000, 1);
        assert!(matches!(
            session.insert_breakpoint(&hw),
            Err(Error::PacketUnsupported("Z1"))
        ));
        assert!(matches!(
            session.remove_breakpoint(BreakpointKind::Hardware, 0x1000, 1),
            Err(Error::PacketUnsupported("Z1"))
        ));

        let wp = Breakpoint::new(BreakpointKind::WriteWatchpoint, 0x3000, 4);
        assert!(matches!(
            session.insert_breakpoint(&wp),
            Err(Error::PacketRejected(RemoteError::Code(0x16)))
        ));
        assert!(stub.script_done());
    }
}
