use std::net::TcpListener;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use service_fixture::ServiceSpec;

/// Whether `pid` names a live (or unreaped) process.
pub fn alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// `/bin/sh -c script` with short grace and poll intervals.
pub fn sh(name: &str, script: &str) -> ServiceSpec {
    ServiceSpec::new(name, "/bin/sh")
        .args(["-c", script])
        .grace_period(Duration::from_millis(500))
        .poll_interval(Duration::from_millis(50))
}
