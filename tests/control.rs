//! Control channel: client commands reaching the server callback.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pipebus::{client, server, ClientFlags, EndpointInfo, PipeError, ServerFlags};

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn control_echo() {
    let _ = env_logger::builder().is_test(true).try_init();
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/ctl/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("ctl", "text", "ctl-server", 65536);
    info.location = dir.clone();

    let commands: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = commands.clone();
    server::set_control_cb(0, move |_ch, bytes| {
        sink.lock().unwrap().push(bytes.to_vec());
    })
    .unwrap();
    server::create(0, info, ServerFlags::EN_CONTROL_PIPE).unwrap();

    client::open(0, &dir, "commander", ClientFlags::empty(), 0).unwrap();
    client::send_control_cmd(0, b"ping\0").unwrap();

    wait_for("command to arrive", || commands.lock().unwrap().len() == 1);
    // A little settle time to prove it fires exactly once.
    std::thread::sleep(Duration::from_millis(100));
    let got = commands.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], b"ping\0");
    drop(got);

    client::close(0).unwrap();
    server::close(0).unwrap();
}

#[test]
fn control_str_appends_terminator() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/ctl2/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("ctl2", "text", "ctl-server", 65536);
    info.location = dir.clone();

    let commands: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = commands.clone();
    server::set_control_cb(1, move |_ch, bytes| {
        sink.lock().unwrap().push(bytes.to_vec());
    })
    .unwrap();
    server::create(1, info, ServerFlags::EN_CONTROL_PIPE).unwrap();

    client::open(1, &dir, "commander", ClientFlags::empty(), 0).unwrap();
    client::send_control_cmd_str(1, "reset").unwrap();
    wait_for("command", || commands.lock().unwrap().len() == 1);
    assert_eq!(commands.lock().unwrap()[0], b"reset\0");

    client::close(1).unwrap();
    server::close(1).unwrap();
}

#[test]
fn control_without_pipe_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/noctl/", tmp.path().to_str().unwrap());

    let mut info = EndpointInfo::new("noctl", "text", "ctl-server", 65536);
    info.location = dir.clone();
    server::create(2, info, ServerFlags::empty()).unwrap();

    client::open(2, &dir, "commander", ClientFlags::empty(), 0).unwrap();
    assert_eq!(
        client::send_control_cmd(2, b"ping\0"),
        Err(PipeError::CtrlNotAvailable)
    );

    client::close(2).unwrap();
    server::close(2).unwrap();
}

#[test]
fn control_sizes_must_precede_create() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = format!("{}/sized/", tmp.path().to_str().unwrap());

    server::set_control_sizes(3, 128 * 1024, 2048).unwrap();
    let mut info = EndpointInfo::new("sized", "text", "ctl-server", 65536);
    info.location = dir.clone();
    server::create(3, info, ServerFlags::EN_CONTROL_PIPE).unwrap();

    // Too late now.
    assert_eq!(
        server::set_control_sizes(3, 1024, 1024),
        Err(PipeError::InvalidArg)
    );
    server::close(3).unwrap();
}
