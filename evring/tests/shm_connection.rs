//! A connection whose page and event tables live in POSIX shared memory,
//! with each party holding its own mappings.
//!
//! Skipped when the environment forbids `shm_open` (EACCES).

use std::thread;
use std::time::Duration;

use evring::connection::Connection;
use evring::event::{EventChannel, EventTable};
use evring::host::FutexHost;
use evring::ipc::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmPath};
use evring::page::SharedPage;
use evring::runtime::{Application, ConnectionId, Context, RunLoop, RunLoopConfig};
use evring::sched::{Deadline, Scheduler};
use rustix::io::Errno;
use serial_test::serial;

type Page = SharedPage<64>;
type PageMap = Shm<Page, Opener>;
type TableMap = Shm<EventTable, Opener>;

fn fresh(name: &str) -> ShmPath {
    let path = ShmPath::new(name).unwrap();
    let _ = rustix::shm::unlink(path.as_str());
    path
}

fn create_or_skip<T: SharedMemorySafe + Default>(path: &ShmPath) -> Option<Shm<T, Creator>> {
    match Shm::<T, Creator>::create(path) {
        Ok(shm) => Some(shm),
        Err(err) if err.errno() == Some(Errno::ACCESS) => {
            eprintln!("Skipping shared memory test: {err}");
            None
        }
        Err(err) => panic!("create failed: {err}"),
    }
}

fn open_table(path: &ShmPath) -> TableMap {
    TableMap::open(path).unwrap()
}

/// Echoes until `want` bytes went through, then stops.
struct EchoOnce {
    want: usize,
    got: usize,
}

impl Application for EchoOnce {
    type Timer = ();

    fn on_data(&mut self, cx: &mut dyn Context<()>, id: ConnectionId, data: &[u8]) {
        cx.send(id, data).unwrap();
        self.got += data.len();
        if self.got >= self.want {
            cx.stop();
        }
    }
}

#[test]
#[serial]
fn echo_over_posix_shared_memory() {
    let page_path = fresh("/evring-it-page");
    let front_path = fresh("/evring-it-front-events");
    let back_path = fresh("/evring-it-back-events");
    let Some(_page_owner) = create_or_skip::<Page>(&page_path) else {
        return;
    };
    let Some(_front_owner) = create_or_skip::<EventTable>(&front_path) else {
        return;
    };
    let Some(_back_owner) = create_or_skip::<EventTable>(&back_path) else {
        return;
    };

    let front_table = open_table(&front_path);
    let back_table = open_table(&back_path);
    let front_port = front_table.bind().unwrap();
    let back_port = back_table.bind().unwrap();

    // Back end: a run loop on its own thread with its own mappings.
    let back_ch = EventChannel::new(
        open_table(&back_path),
        back_port,
        open_table(&front_path),
        front_port,
        FutexHost,
    )
    .unwrap();
    let config = RunLoopConfig {
        max_block: None,
        ..RunLoopConfig::default()
    };
    let mut back: RunLoop<PageMap, TableMap, FutexHost, EchoOnce, 64> =
        RunLoop::new(config, back_table, FutexHost, EchoOnce { want: 5, got: 0 }).unwrap();
    back.add_connection(Connection::back(PageMap::open(&page_path).unwrap(), back_ch));
    let back_thread = thread::spawn(move || {
        let result = back.run();
        result.map(|()| back.stats().bytes_received)
    });

    // Front end: a bare connection plus the scheduler.
    let front_ch = EventChannel::new(
        open_table(&front_path),
        front_port,
        open_table(&back_path),
        back_port,
        FutexHost,
    )
    .unwrap();
    let mut front = Connection::front(PageMap::open(&page_path).unwrap(), front_ch);
    let sched = Scheduler::new(front_table, FutexHost);

    assert_eq!(front.send(b"hello").unwrap(), 5);
    let deadline = Deadline::after(Duration::from_secs(10));
    let mut reply = Vec::new();
    let mut buf = [0u8; 64];
    while reply.len() < 5 {
        front.consume_pending().unwrap();
        let n = front.recv(&mut buf).unwrap();
        reply.extend_from_slice(&buf[..n]);
        if n == 0 {
            assert!(!deadline.has_passed(), "no reply from the back end");
            sched.block_until(deadline).unwrap();
        }
    }

    assert_eq!(reply, b"hello");
    assert_eq!(back_thread.join().unwrap().unwrap(), 5);
}

#[test]
#[serial]
fn page_layout_is_visible_through_a_second_mapping() {
    let path = fresh("/evring-it-layout");
    let Some(owner) = create_or_skip::<Page>(&path) else {
        return;
    };
    let peer = PageMap::open(&path).unwrap();
    assert_eq!(owner.capacity(), 64);

    let front = evring::ring::Writer::new(owner, evring::page::Direction::Out);
    let back = evring::ring::Reader::new(peer, evring::page::Direction::Out);
    assert_eq!(front.write(b"HELLOWORLD").unwrap(), 10);
    assert_eq!(back.available_to_read().unwrap(), 10);
    assert_eq!(back.read_to_vec(4).unwrap(), b"HELL");
    assert_eq!(front.page().indices(evring::page::Direction::Out), (10, 4));
}
