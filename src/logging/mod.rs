//! Asynchronous logging channel.
//!
//! Producer threads enqueue entries and control packets onto an MPSC queue;
//! a single worker drains it, runs each entry through the attached policies,
//! resolves backtraces when enabled, and fans the entry out to every
//! attached driver. Attach and flush block the caller until the worker has
//! processed the packet; entry submission and the drop-time kill packet are
//! fire-and-forget and never propagate failures to the caller.

mod driver;
mod entry;

pub use driver::{Driver, LevelFilterPolicy, MemoryDriver, Policy, StderrDriver};
pub use entry::{Entry, Level};

use std::any::Any;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

enum PacketAction {
    AttachDriver(Box<dyn Driver>),
    AttachPolicy(Box<dyn Policy>),
    AttachObject(Box<dyn Any + Send>),
    Flush,
    /// Stop resolving traces, then flush; used on entry-point exit paths
    /// where symbolication may no longer be safe.
    FlushEntryPointExit,
    Kill,
}

struct Packet {
    action: PacketAction,
    done: Option<Sender<()>>,
}

enum QueueElement {
    Entry(Entry),
    Packet(Packet),
}

/// Last-resort sink for failures inside the logging machinery itself.
fn panic_log(message: &str) {
    eprintln!("[log-channel panic] {message}");
}

struct Worker {
    drivers: Vec<Box<dyn Driver>>,
    policies: Vec<Box<dyn Policy>>,
    objects: Vec<Box<dyn Any + Send>>,
    resolving_traces: bool,
}

impl Worker {
    fn run(mut self, rx: Receiver<QueueElement>) {
        while let Ok(element) = rx.recv() {
            match element {
                QueueElement::Entry(entry) => self.process_entry(entry),
                QueueElement::Packet(packet) => {
                    let exit = matches!(packet.action, PacketAction::Kill);
                    self.process_packet(packet.action);
                    if let Some(done) = packet.done {
                        let _ = done.send(());
                    }
                    if exit {
                        break;
                    }
                }
            }
        }
    }

    fn process_entry(&mut self, mut entry: Entry) {
        for policy in &mut self.policies {
            if !policy.transform_filter(&mut entry) {
                return;
            }
        }
        if !entry.trace_resolved && self.resolving_traces {
            if let Some(trace) = entry.trace.as_mut() {
                trace.resolve();
                entry.trace_resolved = true;
            }
        }
        if self.drivers.is_empty() {
            panic_log("no drivers attached while processing entry");
            return;
        }
        for driver in &mut self.drivers {
            driver.submit(&entry);
        }
    }

    fn process_packet(&mut self, action: PacketAction) {
        match action {
            PacketAction::AttachDriver(d) => self.drivers.push(d),
            PacketAction::AttachPolicy(p) => self.policies.push(p),
            PacketAction::AttachObject(o) => self.objects.push(o),
            PacketAction::Flush => self.flush(),
            PacketAction::FlushEntryPointExit => {
                self.resolving_traces = false;
                self.flush();
            }
            PacketAction::Kill => {}
        }
    }

    fn flush(&mut self) {
        for driver in &mut self.drivers {
            driver.flush();
        }
    }
}

/// Handle to the logging channel; clone the sender side freely by sharing
/// the channel behind an `Arc`.
pub struct Channel {
    tx: Sender<QueueElement>,
    worker: Option<JoinHandle<()>>,
}

impl Channel {
    pub fn new(drivers: Vec<Box<dyn Driver>>) -> Channel {
        let (tx, rx) = unbounded();
        let worker = Worker {
            drivers,
            policies: Vec::new(),
            objects: Vec::new(),
            resolving_traces: true,
        };
        let handle = std::thread::Builder::new()
            .name("log-chan".into())
            .spawn(move || worker.run(rx))
            .expect("could not spawn log channel worker");
        Channel {
            tx,
            worker: Some(handle),
        }
    }

    /// Enqueues an entry without blocking. Failures are reported to the
    /// panic sink, never to the caller.
    pub fn submit(&self, entry: Entry) {
        if self.tx.send(QueueElement::Entry(entry)).is_err() {
            panic_log("submit failed: worker gone");
        }
    }

    fn enqueue_packet_wait(&self, action: PacketAction) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let packet = Packet {
            action,
            done: Some(done_tx),
        };
        if self.tx.send(QueueElement::Packet(packet)).is_err() {
            panic_log("packet enqueue failed: worker gone");
            return;
        }
        let _ = done_rx.recv();
    }

    /// Attaches a driver; returns once the worker has installed it.
    pub fn attach_driver(&self, driver: Box<dyn Driver>) {
        self.enqueue_packet_wait(PacketAction::AttachDriver(driver));
    }

    /// Attaches a policy; returns once the worker has installed it.
    pub fn attach_policy(&self, policy: Box<dyn Policy>) {
        self.enqueue_packet_wait(PacketAction::AttachPolicy(policy));
    }

    /// Parks an object whose lifetime must outlast all queued entries
    /// (driver backing state, shared buffers).
    pub fn attach_object(&self, object: Box<dyn Any + Send>) {
        self.enqueue_packet_wait(PacketAction::AttachObject(object));
    }

    /// Blocks until every queued entry before this call has been flushed
    /// through all drivers.
    pub fn flush(&self) {
        self.enqueue_packet_wait(PacketAction::Flush);
    }

    /// Disables trace resolution and flushes; for entry-point exit paths.
    pub fn flush_entry_point_exit(&self) {
        self.enqueue_packet_wait(PacketAction::FlushEntryPointExit);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Fire-and-forget: the worker drains everything queued ahead of the
        // kill packet, then exits.
        let _ = self.tx.send(QueueElement::Packet(Packet {
            action: PacketAction::Kill,
            done: None,
        }));
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_fan_out_to_all_drivers() {
        let (mem1, lines1) = MemoryDriver::new();
        let (mem2, lines2) = MemoryDriver::new();
        let channel = Channel::new(vec![Box::new(mem1)]);
        channel.attach_driver(Box::new(mem2));

        channel.submit(Entry::new(Level::Info, "hello").with_source(file!(), line!()));
        channel.flush();

        assert_eq!(lines1.lock().unwrap().len(), 1);
        assert_eq!(lines2.lock().unwrap().len(), 1);
        assert!(lines1.lock().unwrap()[0].1.contains("hello"));
    }

    #[test]
    fn policy_can_drop_entries() {
        let (mem, lines) = MemoryDriver::new();
        let channel = Channel::new(vec![Box::new(mem)]);
        channel.attach_policy(Box::new(LevelFilterPolicy {
            threshold: Level::Warn,
        }));

        channel.submit(Entry::new(Level::Error, "kept"));
        channel.submit(Entry::new(Level::Debug, "dropped"));
        channel.flush();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, Level::Error);
    }

    #[test]
    fn drop_drains_queued_entries() {
        let (mem, lines) = MemoryDriver::new();
        {
            let channel = Channel::new(vec![Box::new(mem)]);
            for i in 0..100 {
                channel.submit(Entry::new(Level::Info, format!("entry {i}")));
            }
        }
        // Channel dropped: the kill packet queued behind all entries.
        assert_eq!(lines.lock().unwrap().len(), 100);
    }

    #[test]
    fn traces_resolve_on_the_worker() {
        let (mem, lines) = MemoryDriver::new();
        let channel = Channel::new(vec![Box::new(mem)]);
        channel.submit(Entry::new(Level::Error, "with trace").with_trace());
        channel.flush();
        // The resolved trace renders with at least one frame line.
        assert!(lines.lock().unwrap()[0].1.contains('\n'));
    }
}
