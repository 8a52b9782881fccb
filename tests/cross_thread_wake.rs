//! §8 concrete scenario 3: signals raised from other threads are coalesced
//! into a single `Signalled` event per zero-to-nonzero transition of an
//! object's mask, no matter how many distinct signal calls landed while the
//! object's reactor hadn't yet woken up to observe them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use solidframe_core::clock::Instant;
use solidframe_core::config::{ReactorConfig, SchedulerConfig};
use solidframe_core::object::{ActiveObject, Disposition, Events, SocketStub};
use solidframe_core::scheduler::Scheduler;

struct WakeCounter {
    stub: SocketStub,
    wakeups: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ActiveObject for WakeCounter {
    fn execute(&mut self, events: Events, _timeout: &mut Instant) -> Disposition {
        if events.contains(Events::SIGNALLED) {
            self.wakeups.fetch_add(1, Ordering::SeqCst);
        }
        if self.wakeups.load(Ordering::SeqCst) >= 3 {
            self.closes.fetch_add(1, Ordering::SeqCst);
            return Disposition::Close;
        }
        Disposition::Wait(Instant::NEVER)
    }

    fn socket_count(&self) -> usize {
        1
    }

    fn stub(&self, _index: usize) -> &SocketStub {
        &self.stub
    }

    fn stub_mut(&mut self, _index: usize) -> &mut SocketStub {
        &mut self.stub
    }
}

#[test]
fn many_coalesced_signals_produce_few_wakeups() {
    let scheduler = Scheduler::start(SchedulerConfig {
        worker_count: 1,
        reactor: ReactorConfig {
            capacity: 8,
            ..Default::default()
        },
    })
    .unwrap();

    let wakeups = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let uid = scheduler
        .push(Box::new(WakeCounter {
            stub: SocketStub::default(),
            wakeups: wakeups.clone(),
            closes: closes.clone(),
        }))
        .unwrap();

    std::thread::sleep(Duration::from_millis(30));

    // Fire a burst of signals from several threads at once, well beyond what
    // three observed wakeups would require; `SignalMask::signal` coalesces
    // everything raised between the reactor taking the mask and the next
    // time it's read back into a single pending wake.
    std::thread::scope(|scope| {
        for _ in 0 .. 50 {
            scope.spawn(|| scheduler.signal(uid, 0x1));
        }
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while closes.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(closes.load(Ordering::SeqCst), 1);
    // The object only needed 3 observed wakeups to close; however many of
    // the 50 raw `signal` calls coalesced, `execute` never saw more calls
    // than there were wakeups actually delivered.
    assert!(wakeups.load(Ordering::SeqCst) >= 3);
    assert!(wakeups.load(Ordering::SeqCst) < 50);

    scheduler.stop(true);
}
