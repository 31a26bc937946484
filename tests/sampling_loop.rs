use async_trait::async_trait;
use gauge_logger::bus::BusTransport;
use gauge_logger::errors::{BusError, BusResult, LoggerError, SinkResult, TransactionCause};
use gauge_logger::fault::{FaultMode, FaultPolicy, SENTINEL};
use gauge_logger::registers::{RegisterEntry, RegisterMap, PRIMARY_TARGET};
use gauge_logger::scheduler::{probe, EndReason, LoopSettings, LoopState, SamplingLoop};
use gauge_logger::sink::{Sample, Sink};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

#[derive(Default)]
struct Recorder {
    reads: Mutex<Vec<(Instant, u8)>>,
    block_reads: AtomicUsize,
    closes: AtomicUsize,
}

struct MockTransport {
    registers: HashMap<(u8, u8), u16>,
    failing: HashSet<(u8, u8)>,
    flaky: HashMap<(u8, u8), u32>,
    unplug_after: Option<usize>,
    read_delay: Duration,
    recorder: Arc<Recorder>,
    closed: bool,
    /// Flip the shutdown flag when this register is read
    shutdown_on: Option<(u8, watch::Sender<bool>)>,
}

impl MockTransport {
    fn new(recorder: Arc<Recorder>) -> Self {
        let registers = (0..8u8)
            .map(|reg| ((PRIMARY_TARGET, reg), 0x1000 + u16::from(reg)))
            .collect();
        Self {
            registers,
            failing: HashSet::new(),
            flaky: HashMap::new(),
            unplug_after: None,
            read_delay: Duration::ZERO,
            recorder,
            closed: false,
            shutdown_on: None,
        }
    }

    fn check(&mut self, target: u8, register: u8) -> BusResult<()> {
        if self.closed {
            return Err(BusError::unavailable("mock", "closed"));
        }
        let reads = self.recorder.reads.lock().unwrap().len();
        if self.unplug_after.is_some_and(|limit| reads > limit) {
            return Err(BusError::unavailable("mock", "device unplugged"));
        }
        if self.failing.contains(&(target, register)) {
            return Err(BusError::transaction(TransactionCause::NoAck, "injected"));
        }
        if let Some(remaining) = self.flaky.get_mut(&(target, register)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::transaction(TransactionCause::Timeout, "injected"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn read_register(&mut self, target: u8, register: u8) -> BusResult<u16> {
        self.recorder.reads.lock().unwrap().push((Instant::now(), register));
        if let Some((trigger, tx)) = &self.shutdown_on {
            if *trigger == register {
                tx.send(true).unwrap();
            }
        }
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        self.check(target, register)?;
        Ok(self.registers.get(&(target, register)).copied().unwrap_or(0))
    }

    async fn write_register(&mut self, target: u8, register: u8, value: u16) -> BusResult<()> {
        self.check(target, register)?;
        self.registers.insert((target, register), value);
        Ok(())
    }

    async fn read_words(&mut self, target: u8, register: u8, count: usize) -> BusResult<Vec<u16>> {
        self.recorder.block_reads.fetch_add(1, Ordering::SeqCst);
        let mut words = Vec::with_capacity(count);
        for offset in 0..count as u8 {
            let reg = register + offset;
            self.check(target, reg)?;
            words.push(self.registers.get(&(target, reg)).copied().unwrap_or(0));
        }
        Ok(words)
    }

    fn close(&mut self) -> BusResult<()> {
        if !self.closed {
            self.closed = true;
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemorySink {
    header: Vec<String>,
    rows: Vec<Sample>,
    flushes: usize,
}

impl Sink for MemorySink {
    fn write_header(&mut self, columns: &[String]) -> SinkResult<()> {
        self.header = columns.to_vec();
        Ok(())
    }

    fn write_row(&mut self, sample: &Sample) -> SinkResult<()> {
        self.rows.push(sample.clone());
        Ok(())
    }

    fn flush(&mut self) -> SinkResult<()> {
        self.flushes += 1;
        Ok(())
    }
}

fn five_registers() -> RegisterMap {
    RegisterMap::new(vec![
        RegisterEntry::new(0x000, "Status"),
        RegisterEntry::new(0x001, "VAlrtTh"),
        RegisterEntry::new(0x002, "TAlrtTh"),
        RegisterEntry::new(0x003, "SAlrtTh"),
        RegisterEntry::new(0x004, "AtRate"),
    ])
}

fn settings(interval_ms: u64, count: u64, mode: FaultMode, retries: u32) -> LoopSettings {
    LoopSettings {
        interval: Duration::from_millis(interval_ms),
        status_interval: Duration::from_secs(30),
        sample_count: Some(count),
        block_reads: false,
        policy: FaultPolicy::new(mode, retries),
    }
}

fn sweep_starts(recorder: &Recorder) -> Vec<Instant> {
    recorder
        .reads
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, reg)| *reg == 0x00)
        .map(|(at, _)| *at)
        .collect()
}

#[tokio::test]
async fn continue_mode_logs_sentinel_for_failed_register() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    transport.failing.insert((PRIMARY_TARGET, 0x03));
    let (_tx, rx) = watch::channel(false);

    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings(1, 2, FaultMode::Continue, 0),
        rx,
    );
    let report = sampler.run().await.unwrap();

    assert_eq!(report.reason, EndReason::SampleLimit);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.stats.skipped_reads, 2);

    let sink = sampler.into_sink();
    assert_eq!(sink.header.len(), 5);
    assert_eq!(sink.rows.len(), 2);
    for row in &sink.rows {
        assert_eq!(row.values, vec![0x1000, 0x1001, 0x1002, SENTINEL, 0x1004]);
    }
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn strict_mode_aborts_without_partial_row() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    transport.failing.insert((PRIMARY_TARGET, 0x03));
    let (_tx, rx) = watch::channel(false);

    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings(1, 10, FaultMode::Strict, 0),
        rx,
    );
    let report = sampler.run().await.unwrap();

    assert_eq!(report.reason, EndReason::Aborted);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        report.fault.as_ref().and_then(BusError::cause),
        Some(TransactionCause::NoAck)
    );

    let sink = sampler.into_sink();
    assert_eq!(sink.header.len(), 5);
    assert!(sink.rows.is_empty());
    assert!(sink.flushes >= 1);
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    // Register 4 was never attempted
    assert!(recorder.reads.lock().unwrap().iter().all(|(_, reg)| *reg != 0x04));
}

#[tokio::test]
async fn retry_recovers_a_flaky_read() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    transport.flaky.insert((PRIMARY_TARGET, 0x02), 1);
    let (_tx, rx) = watch::channel(false);

    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings(1, 1, FaultMode::Strict, 1),
        rx,
    );
    let report = sampler.run().await.unwrap();

    assert_eq!(report.reason, EndReason::SampleLimit);
    assert_eq!(report.stats.retries, 1);
    assert_eq!(report.stats.skipped_reads, 0);
    assert_eq!(sampler.sink().rows[0].values[2], 0x1002);
}

#[tokio::test]
async fn unplugged_bus_aborts_in_continue_mode() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    transport.unplug_after = Some(7);
    let (_tx, rx) = watch::channel(false);

    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings(1, 10, FaultMode::Continue, 3),
        rx,
    );
    let report = sampler.run().await.unwrap();

    assert_eq!(report.reason, EndReason::Aborted);
    assert_eq!(report.stats.retries, 0);
    assert_eq!(sampler.sink().rows.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fixed_cadence_does_not_drift() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    // 5 reads x 20 ms: a 100 ms sweep
    transport.read_delay = Duration::from_millis(20);
    let (_tx, rx) = watch::channel(false);

    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings(1_000, 6, FaultMode::Continue, 0),
        rx,
    );
    let report = sampler.run().await.unwrap();
    assert_eq!(report.stats.sweeps, 6);
    assert_eq!(report.stats.overruns, 0);

    let starts = sweep_starts(&recorder);
    assert_eq!(starts.len(), 6);
    for (n, start) in starts.iter().enumerate() {
        assert_eq!(*start - starts[0], Duration::from_secs(n as u64));
    }
}

#[tokio::test(start_paused = true)]
async fn overrun_starts_next_sweep_immediately() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    // 150 ms sweep against a 100 ms interval
    transport.read_delay = Duration::from_millis(30);
    let (_tx, rx) = watch::channel(false);

    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings(100, 3, FaultMode::Continue, 0),
        rx,
    );
    let report = sampler.run().await.unwrap();
    assert_eq!(report.stats.overruns, 2);

    let starts = sweep_starts(&recorder);
    assert_eq!(starts[1] - starts[0], Duration::from_millis(150));
    assert_eq!(starts[2] - starts[1], Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_the_wait_early() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    transport.read_delay = Duration::from_millis(20);
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        tx.send(true).unwrap();
    });

    let mut settings = settings(1_000, 100, FaultMode::Continue, 0);
    settings.sample_count = None;
    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings,
        rx,
    );
    let started = Instant::now();
    let report = sampler.run().await.unwrap();

    assert_eq!(report.reason, EndReason::Interrupted);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(sampler.sink().rows.len(), 3);
    assert_eq!(started.elapsed(), Duration::from_millis(2_500));
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_during_sweep_discards_the_partial_row() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    let (tx, rx) = watch::channel(false);
    transport.shutdown_on = Some((0x02, tx));

    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings(1_000, 10, FaultMode::Continue, 0),
        rx,
    );
    assert_eq!(sampler.state(), LoopState::Idle);
    let report = sampler.run().await.unwrap();

    assert_eq!(report.reason, EndReason::Interrupted);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(sampler.state(), LoopState::Terminated);
    assert_eq!(sampler.stats().sweeps, 0);
    assert_eq!(sampler.stats().skipped_reads, 0);
    assert!(sampler.sink().rows.is_empty());

    // The read in flight finishes, the next one never starts
    let registers: Vec<u8> = recorder
        .reads
        .lock()
        .unwrap()
        .iter()
        .map(|(_, reg)| *reg)
        .collect();
    assert_eq!(registers, vec![0x00, 0x01, 0x02]);
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn block_reads_fetch_a_page_at_once() {
    let recorder = Arc::new(Recorder::default());
    let transport = MockTransport::new(recorder.clone());
    let (_tx, rx) = watch::channel(false);

    let mut settings = settings(1, 2, FaultMode::Continue, 0);
    settings.block_reads = true;
    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings,
        rx,
    );
    sampler.run().await.unwrap();

    assert_eq!(recorder.block_reads.load(Ordering::SeqCst), 2);
    assert!(recorder.reads.lock().unwrap().is_empty());
    assert_eq!(
        sampler.sink().rows[1].values,
        vec![0x1000, 0x1001, 0x1002, 0x1003, 0x1004]
    );
}

#[tokio::test]
async fn failed_block_falls_back_to_single_reads() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());
    transport.failing.insert((PRIMARY_TARGET, 0x03));
    let (_tx, rx) = watch::channel(false);

    let mut settings = settings(1, 1, FaultMode::Continue, 0);
    settings.block_reads = true;
    let mut sampler = SamplingLoop::new(
        Box::new(transport),
        MemorySink::default(),
        five_registers(),
        settings,
        rx,
    );
    let report = sampler.run().await.unwrap();

    assert_eq!(report.stats.skipped_reads, 1);
    assert_eq!(recorder.reads.lock().unwrap().len(), 5);
    assert_eq!(
        sampler.sink().rows[0].values,
        vec![0x1000, 0x1001, 0x1002, SENTINEL, 0x1004]
    );
}

#[tokio::test]
async fn mock_round_trip_and_double_close() {
    let recorder = Arc::new(Recorder::default());
    let mut transport = MockTransport::new(recorder.clone());

    transport.write_register(PRIMARY_TARGET, 0x05, 0xBEEF).await.unwrap();
    assert_eq!(transport.read_register(PRIMARY_TARGET, 0x05).await.unwrap(), 0xBEEF);

    transport.close().unwrap();
    transport.close().unwrap();
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    assert!(matches!(
        transport.read_register(PRIMARY_TARGET, 0x05).await,
        Err(BusError::BusUnavailable { .. })
    ));
}

#[tokio::test]
async fn probe_reports_the_unreachable_target() {
    let mut transport = MockTransport::new(Arc::new(Recorder::default()));
    transport.failing.insert((PRIMARY_TARGET, 0x00));

    let err = probe(&mut transport, &five_registers()).await.unwrap_err();
    assert!(matches!(
        err,
        LoggerError::ProbeFailed { target, .. } if target == PRIMARY_TARGET
    ));
}
