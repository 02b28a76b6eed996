#[cfg(test)]
mod tests {
    use crate::block::{Block, BlockIo, Channel, Device, Direction, Thread};
    use crate::config::SystemConfig;
    use crate::connector::Connection;
    use crate::event::{Event, EventKind, Manager, Param};
    use crate::rt::{System, TelemetryKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    struct MockDevice {
        block: Block,
        reads: Arc<AtomicUsize>,
    }

    impl MockDevice {
        fn new(name: &str) -> Self {
            Self {
                block: Block::new(
                    name,
                    vec![
                        Channel::input("analog in", "input channel", 1),
                        Channel::output("analog out", "output channel", 1),
                    ],
                ),
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl BlockIo for MockDevice {
        fn block(&self) -> &Block {
            &self.block
        }
        fn block_mut(&mut self) -> &mut Block {
            &mut self.block
        }
    }

    impl Device for MockDevice {
        fn read(&mut self) {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let _ = self.block.write_output(0, &[1.0]);
        }
        fn write(&mut self) {}
    }

    struct Doubler {
        block: Block,
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        last: Arc<Mutex<f64>>,
    }

    impl Doubler {
        fn new(tag: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                block: Block::new(
                    tag,
                    vec![Channel::input("in", "", 1), Channel::output("out", "", 1)],
                ),
                tag,
                log,
                last: Arc::new(Mutex::new(0.0)),
            }
        }
    }

    impl BlockIo for Doubler {
        fn block(&self) -> &Block {
            &self.block
        }
        fn block_mut(&mut self) -> &mut Block {
            &mut self.block
        }
    }

    impl Thread for Doubler {
        fn execute(&mut self) {
            let doubled = self.block.read_input(0).map(|s| s[0] * 2.0).unwrap_or(0.0);
            let _ = self.block.write_output(0, &[doubled]);
            *self.last.lock().unwrap() = doubled;
            self.log.lock().unwrap().push(self.tag);
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn link(src: crate::block::BlockId, dest: crate::block::BlockId) -> Connection {
        Connection {
            src,
            src_direction: Direction::Output,
            src_port: 0,
            dest,
            dest_port: 0,
        }
    }

    #[test]
    fn period_round_trip() {
        let manager = Manager::new().unwrap();
        let system = System::launch(SystemConfig::default(), &manager).unwrap();
        assert_eq!(system.get_period(), 1_000_000);

        let ev = Event::with(EventKind::PeriodChange, vec![("period", Param::I64(500_000))]);
        manager.post(&ev);
        assert!(ev.is_done());
        assert_eq!(system.get_period(), 500_000);
        let records = system.poll_telemetry();
        let updates: Vec<_> = records
            .iter()
            .filter(|r| r.kind == TelemetryKind::PeriodUpdate)
            .collect();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].command.is_some());

        let ev = Event::with(
            EventKind::PeriodChange,
            vec![("period", Param::I64(1_000_000))],
        );
        manager.post(&ev);
        assert_eq!(system.get_period(), 1_000_000);
        assert_eq!(
            system.last_telemetry().map(|r| r.kind),
            Some(TelemetryKind::PeriodUpdate)
        );
    }

    #[test]
    fn equal_period_is_a_no_op() {
        let manager = Manager::new().unwrap();
        let system = System::launch(SystemConfig::default(), &manager).unwrap();
        system.poll_telemetry();

        let ev = Event::with(
            EventKind::PeriodChange,
            vec![("period", Param::I64(1_000_000))],
        );
        manager.post(&ev);
        assert!(ev.is_done());
        assert_eq!(system.get_period(), 1_000_000);
        assert!(
            system
                .poll_telemetry()
                .iter()
                .all(|r| r.kind != TelemetryKind::PeriodUpdate)
        );
    }

    #[test]
    fn get_period_event_reports_current_value() {
        let manager = Manager::new().unwrap();
        let _system = System::launch(SystemConfig::default(), &manager).unwrap();
        let ev = Event::new(EventKind::GetPeriod);
        manager.post(&ev);
        assert_eq!(ev.get_i64("period"), Some(1_000_000));
    }

    #[test]
    fn insert_and_remove_device() {
        let manager = Manager::new().unwrap();
        let system = System::launch(SystemConfig::default(), &manager).unwrap();

        let device = MockDevice::new("mock");
        let id = device.block().id();
        let ev = Event::with(
            EventKind::DeviceInsert,
            vec![("device", Param::Device(Box::new(device)))],
        );
        manager.post(&ev);
        assert!(system.is_registered(id));
        assert_eq!(
            system.last_telemetry().map(|r| r.kind),
            Some(TelemetryKind::DeviceListUpdate)
        );

        let ev = Event::with(EventKind::DeviceRemove, vec![("block", Param::Block(id))]);
        manager.post(&ev);
        assert!(!system.is_registered(id));
        assert_eq!(
            system.last_telemetry().map(|r| r.kind),
            Some(TelemetryKind::DeviceListUpdate)
        );
        // The removed device returns to host ownership through the event.
        let reclaimed = ev.take_device("device").expect("device handed back");
        assert_eq!(reclaimed.block().id(), id);
    }

    #[test]
    fn pause_gates_device_hooks() {
        let manager = Manager::new().unwrap();
        let system = System::launch(SystemConfig::default(), &manager).unwrap();

        let device = MockDevice::new("gated");
        let id = device.block().id();
        let reads = device.reads.clone();
        manager.post(&Event::with(
            EventKind::DeviceInsert,
            vec![("device", Param::Device(Box::new(device)))],
        ));

        // Registered blocks start inactive.
        thread::sleep(Duration::from_millis(10));
        assert_eq!(reads.load(Ordering::Relaxed), 0);

        manager.post(&Event::with(
            EventKind::DeviceUnpause,
            vec![("block", Param::Block(id))],
        ));
        assert!(wait_until(Duration::from_secs(2), || {
            reads.load(Ordering::Relaxed) > 3
        }));

        manager.post(&Event::with(
            EventKind::DevicePause,
            vec![("block", Param::Block(id))],
        ));
        let frozen = reads.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        // One in-flight tick of slack.
        assert!(reads.load(Ordering::Relaxed) <= frozen + 1);
        let _ = system;
    }

    #[test]
    fn chain_executes_in_topological_order() {
        let manager = Manager::new().unwrap();
        let system = System::launch(SystemConfig::default(), &manager).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut a = Doubler::new("a", log.clone());
        let b = Doubler::new("b", log.clone());
        let c = Doubler::new("c", log.clone());
        let c_last = c.last.clone();
        a.block_mut().write_input(0, &[1.0]).unwrap();
        let (ida, idb, idc) = (a.block().id(), b.block().id(), c.block().id());

        for boxed in [Box::new(a) as Box<dyn Thread>, Box::new(b), Box::new(c)] {
            manager.post(&Event::with(
                EventKind::ThreadInsert,
                vec![("thread", Param::Thread(boxed))],
            ));
        }
        for conn in [link(ida, idb), link(idb, idc)] {
            let ev = Event::with(EventKind::LinkInsert, vec![("connection", Param::Connection(conn))]);
            manager.post(&ev);
            assert!(ev.get_str("error").is_none());
        }
        let unpause: Vec<_> = [ida, idb, idc]
            .into_iter()
            .map(|id| Event::with(EventKind::ThreadUnpause, vec![("block", Param::Block(id))]))
            .collect();
        manager.post_batch(&unpause);

        assert!(wait_until(Duration::from_secs(2), || {
            (*c_last.lock().unwrap() - 8.0).abs() < f64::EPSILON
        }));

        // Once all three are active, every tick logs a, b, c in order.
        let entries = log.lock().unwrap().clone();
        assert!(
            entries.windows(3).any(|w| w == ["a", "b", "c"]),
            "no full tick found in {entries:?}"
        );
        let _ = system;
    }

    #[test]
    fn cycle_is_reported_and_not_applied() {
        let manager = Manager::new().unwrap();
        let _system = System::launch(SystemConfig::default(), &manager).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let a = Doubler::new("a", log.clone());
        let b = Doubler::new("b", log.clone());
        let (ida, idb) = (a.block().id(), b.block().id());
        for boxed in [Box::new(a) as Box<dyn Thread>, Box::new(b)] {
            manager.post(&Event::with(
                EventKind::ThreadInsert,
                vec![("thread", Param::Thread(boxed))],
            ));
        }

        let ok = Event::with(
            EventKind::LinkInsert,
            vec![("connection", Param::Connection(link(ida, idb)))],
        );
        manager.post(&ok);
        assert!(ok.get_str("error").is_none());

        let cyclic = Event::with(
            EventKind::LinkInsert,
            vec![("connection", Param::Connection(link(idb, ida)))],
        );
        manager.post(&cyclic);
        assert!(cyclic.get_str("error").is_some());

        let query = Event::new(EventKind::ConnectionQuery);
        manager.post(&query);
        let connections = query.take_connections("connections").unwrap();
        assert_eq!(connections, vec![link(ida, idb)]);
    }

    #[test]
    fn link_remove_unwires() {
        let manager = Manager::new().unwrap();
        let _system = System::launch(SystemConfig::default(), &manager).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let a = Doubler::new("a", log.clone());
        let b = Doubler::new("b", log.clone());
        let (ida, idb) = (a.block().id(), b.block().id());
        for boxed in [Box::new(a) as Box<dyn Thread>, Box::new(b)] {
            manager.post(&Event::with(
                EventKind::ThreadInsert,
                vec![("thread", Param::Thread(boxed))],
            ));
        }
        manager.post(&Event::with(
            EventKind::LinkInsert,
            vec![("connection", Param::Connection(link(ida, idb)))],
        ));
        manager.post(&Event::with(
            EventKind::LinkRemove,
            vec![("connection", Param::Connection(link(ida, idb)))],
        ));

        let query = Event::new(EventKind::ConnectionQuery);
        manager.post(&query);
        assert!(query.take_connections("connections").unwrap().is_empty());
    }

    #[test]
    fn block_query_lists_registered_blocks() {
        let manager = Manager::new().unwrap();
        let _system = System::launch(SystemConfig::default(), &manager).unwrap();

        let device = MockDevice::new("mock");
        let id = device.block().id();
        manager.post(&Event::with(
            EventKind::DeviceInsert,
            vec![("device", Param::Device(Box::new(device)))],
        ));

        let query = Event::new(EventKind::BlockQuery);
        manager.post(&query);
        let blocks = query.take_blocks("blockList").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].id, id);
        assert_eq!(blocks[0].name, "mock");
    }

    #[test]
    fn shutdown_then_no_effect() {
        let manager = Manager::new().unwrap();
        let system = System::launch(SystemConfig::default(), &manager).unwrap();

        manager.post(&Event::new(EventKind::Shutdown));
        assert!(wait_until(Duration::from_secs(2), || system.is_shut_down()));
        assert_eq!(
            system.last_telemetry().map(|r| r.kind),
            Some(TelemetryKind::Shutdown)
        );

        let ev = Event::with(EventKind::PeriodChange, vec![("period", Param::I64(123_456))]);
        manager.post(&ev);
        assert!(ev.is_done());
        assert_eq!(system.get_period(), 1_000_000);
    }

    #[test]
    fn concurrent_noops_all_complete() {
        let manager = Arc::new(Manager::new().unwrap());
        let system = System::launch(SystemConfig::default(), &manager).unwrap();

        let mut posters = Vec::new();
        for _ in 0..100 {
            let manager = manager.clone();
            posters.push(thread::spawn(move || {
                let ev = Event::new(EventKind::Noop);
                manager.post(&ev);
                assert!(ev.is_done());
            }));
        }
        for poster in posters {
            poster.join().unwrap();
        }
        assert_eq!(
            system.last_telemetry().map(|r| r.kind),
            Some(TelemetryKind::Noop)
        );
    }

    #[test]
    fn batched_period_changes_apply_in_order() {
        let manager = Manager::new().unwrap();
        let system = System::launch(SystemConfig::default(), &manager).unwrap();

        let events: Vec<_> = [250_000i64, 500_000, 750_000]
            .into_iter()
            .map(|p| Event::with(EventKind::PeriodChange, vec![("period", Param::I64(p))]))
            .collect();
        manager.post_batch(&events);
        for ev in &events {
            assert!(ev.is_done());
        }
        // FIFO application: the last batch entry wins.
        assert_eq!(system.get_period(), 750_000);
        let updates = system
            .poll_telemetry()
            .iter()
            .filter(|r| r.kind == TelemetryKind::PeriodUpdate)
            .count();
        assert_eq!(updates, 3);
    }

    #[test]
    fn telemetry_overflow_is_stamped_after_drain() {
        let manager = Manager::new().unwrap();
        let system = System::launch(
            SystemConfig {
                telemetry_capacity: Some(2),
                ..Default::default()
            },
            &manager,
        )
        .unwrap();

        // Fill the two-slot ring without draining; the overflow marker
        // is pending from here on.
        for _ in 0..4 {
            manager.post(&Event::new(EventKind::Noop));
        }
        let drained = system.poll_telemetry();
        assert_eq!(drained.len(), 2);

        manager.post(&Event::new(EventKind::Noop));
        let records = system.poll_telemetry();
        assert_eq!(
            records.first().map(|r| r.kind),
            Some(TelemetryKind::Error(crate::rt::RtErrorKind::TelemetryOverflow))
        );
        assert_eq!(records.last().map(|r| r.kind), Some(TelemetryKind::Noop));
    }

    #[test]
    fn thread_remove_hands_the_block_back() {
        let manager = Manager::new().unwrap();
        let system = System::launch(SystemConfig::default(), &manager).unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let a = Doubler::new("a", log);
        let id = a.block().id();
        manager.post(&Event::with(
            EventKind::ThreadInsert,
            vec![("thread", Param::Thread(Box::new(a)))],
        ));
        assert!(system.is_registered(id));

        let ev = Event::with(EventKind::ThreadRemove, vec![("block", Param::Block(id))]);
        manager.post(&ev);
        assert!(!system.is_registered(id));
        let reclaimed = ev.take_thread("thread").expect("thread handed back");
        assert_eq!(reclaimed.block().id(), id);
        assert_eq!(
            system.last_telemetry().map(|r| r.kind),
            Some(TelemetryKind::ThreadListUpdate)
        );
    }
}
