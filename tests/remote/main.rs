mod common;

use crate::common::{connect, ScriptedStub, StubScript, TestHook, INTERRUPT, SUPPORTED};
use serial_test::serial;
use stalker_remote::config::SessionConfig;
use stalker_remote::remote::breakpoint::{Breakpoint, BreakpointKind};
use stalker_remote::remote::packet;
use stalker_remote::remote::registry::ResumeRequest;
use stalker_remote::remote::stop::{StopKind, StopReason};
use stalker_remote::remote::{Error, TargetKind, ThreadId};

#[test]
#[serial]
fn test_remote_session() {
    let stub = ScriptedStub::spawn(
        StubScript::new()
            .expect(
                SUPPORTED,
                &["PacketSize=1000;QStartNoAckMode+;multiprocess+;swbreak+;qXfer:threads:read+"],
            )
            .expect("QStartNoAckMode", &["OK"])
            .expect("vCont?", &["vCont;c;C;s;S;t;r"])
            .expect("?", &["T05thread:p7.7;"])
            .expect(
                "qXfer:threads:read::0,ffc",
                &[r#"l<threads><thread id="p7.7" core="1" name="main"/><thread id="p7.8" name="worker"/></threads>"#],
            )
            .expect("qC", &["QCp7.7"])
            .expect("m1000,8", &["0102030405060708"])
            .expect("Z0,401000,1", &["OK"])
            .expect("vCont;c", &["O68690a", "T05thread:p7.8;swbreak:;"])
            .expect("D;7", &["OK"]),
    );

    let hook = TestHook::default();
    let mut target = connect(&stub, TargetKind::Remote, SessionConfig::default(), &hook);
    assert!(!target.session().ack_mode());
    assert_eq!(target.session().packet_size(), 0x1000);
    assert_eq!(target.current_thread(), Some(ThreadId::new(7, 7)));
    assert_eq!(
        *hook.threads.lock().unwrap(),
        vec![ThreadId::new(7, 7), ThreadId::new(7, 8)]
    );
    let main = target.registry().thread(ThreadId::new(7, 7)).unwrap();
    assert_eq!(main.name.as_deref(), Some("main"));
    assert_eq!(main.core, Some(1));

    let mut buf = [0u8; 8];
    target.read_memory(0x1000, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

    let bp = Breakpoint::new(BreakpointKind::Software, 0x401000, 1);
    assert!(!target.insert_breakpoint(&bp).unwrap());

    target
        .resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL)
        .unwrap();
    let stop = target.wait().unwrap();
    assert_eq!(stop.ptid, ThreadId::new(7, 8));
    assert!(matches!(
        stop.kind,
        StopKind::Stopped {
            signal: 5,
            reason: StopReason::SwBreak
        }
    ));
    assert_eq!(*hook.console.lock().unwrap(), "hi\n");
    assert_eq!(target.current_thread(), Some(ThreadId::new(7, 8)));

    target.detach(7).unwrap();
    assert!(target.session().is_closed());
    drop(target);

    let requests = stub.join();
    assert_eq!(requests.last().map(String::as_str), Some("D;7"));
}

#[test]
#[serial]
fn test_extended_session_with_line_noise() {
    let mut noisy = b"$T05thread:p9.9;#00".to_vec();
    noisy.extend(packet::encode(b"T05thread:p9.9;"));

    let stub = ScriptedStub::spawn(
        StubScript::new()
            .expect("!", &["OK"])
            .expect(SUPPORTED, &["PacketSize=200;multiprocess+"])
            .expect("vCont?", &[""])
            .expect("?", &["W00"])
            .expect("qfThreadInfo", &["l"])
            .expect("qC", &[""])
            .expect_raw("vRun;2f62696e2f74727565", &noisy)
            .expect("qfThreadInfo", &["mp9.9"])
            .expect("qsThreadInfo", &["l"])
            .expect("Hc0", &["OK"])
            .expect("c", &["W00;process:9"]),
    );

    let hook = TestHook::default();
    let mut target = connect(&stub, TargetKind::Extended, SessionConfig::default(), &hook);
    assert!(target.session().ack_mode());
    assert!(target.initial_stop().is_none());
    assert!(target.controller().vcont().is_none());

    let stop = target.run("/bin/true", &[]).unwrap();
    assert_eq!(stop.ptid, ThreadId::new(9, 9));

    target
        .resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL)
        .unwrap();
    let stop = target.wait().unwrap();
    assert!(matches!(stop.kind, StopKind::Exited { status: 0 }));
    assert!(target.registry().is_empty());
    assert!(!target.session().is_closed());

    // not negotiated, nothing is sent
    assert!(matches!(
        target.read_auxv(),
        Err(Error::PacketUnsupported("qXfer:auxv:read"))
    ));
    drop(target);

    assert_eq!(stub.join().len(), 11);
}

#[test]
#[serial]
fn test_interrupt_all_stop() {
    let stub = ScriptedStub::spawn(
        StubScript::new()
            .expect(SUPPORTED, &["QStartNoAckMode+;multiprocess+"])
            .expect("QStartNoAckMode", &["OK"])
            .expect("vCont?", &["vCont;c;C;s;S;t"])
            .expect("?", &["T05thread:p3.3;"])
            .expect("qfThreadInfo", &["mp3.3"])
            .expect("qsThreadInfo", &["l"])
            .expect("qC", &["QCp3.3"])
            .expect("vCont;c", &[])
            .expect(INTERRUPT, &["T02thread:p3.3;"])
            .expect("k", &[]),
    );

    let hook = TestHook::default();
    let mut target = connect(&stub, TargetKind::Remote, SessionConfig::default(), &hook);
    target
        .resume(ThreadId::ALL, ResumeRequest::default(), ThreadId::ALL)
        .unwrap();
    target.interrupt().unwrap();

    let stop = target.wait().unwrap();
    assert_eq!(stop.signal(), Some(2));
    assert!(target
        .registry()
        .thread(ThreadId::new(3, 3))
        .unwrap()
        .is_stopped());

    target.kill(3).unwrap();
    assert!(target.session().is_closed());
    drop(target);

    assert_eq!(stub.join().last().map(String::as_str), Some("k"));
}
