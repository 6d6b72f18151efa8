#![no_main]

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use libfuzzer_sys::fuzz_target;
use zcage_supervisor::{SpawnWorker, Supervisor, WorkerHandle};
use zcage_wire::MAX_PAYLOAD;

// In-process fork spawn strategy: the fuzz binary is single-threaded, so a
// plain fork into the worker's serving logic is safe here.
struct ForkSpawner;

impl SpawnWorker for ForkSpawner {
    fn spawn(&self, sock_path: &Path) -> anyhow::Result<WorkerHandle> {
        let pid = zcage_worker::fork_serving_worker(sock_path)?;
        Ok(WorkerHandle::from_pid(pid))
    }
}

struct Session {
    supervisor: Supervisor,
    out: Vec<u8>,
}

// The session is owned by this harness and built on first use; the library
// itself keeps no global state.
static SESSION: OnceLock<Mutex<Session>> = OnceLock::new();

fn session() -> &'static Mutex<Session> {
    SESSION.get_or_init(|| {
        let supervisor = Supervisor::init("./zcage-fuzz.sock", Box::new(ForkSpawner))
            .expect("start the sandboxed worker");
        Mutex::new(Session {
            supervisor,
            out: vec![0u8; MAX_PAYLOAD],
        })
    })
}

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_PAYLOAD {
        return;
    }
    let mut session = session().lock().unwrap();
    let Session { supervisor, out } = &mut *session;
    let _ = supervisor.decompress(data, out);
});
