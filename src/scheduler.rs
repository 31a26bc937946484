//! The sampling loop: sweep the register map on a fixed cadence and hand
//! each completed row to the sink.

use crate::bus::BusTransport;
use crate::config::SamplingConfig;
use crate::errors::{BusError, LoggerError, LoggerResult};
use crate::fault::{FaultAction, FaultPolicy, SENTINEL};
use crate::registers::{RegisterMap, RegisterRun, PAGE_WORDS};
use crate::sink::{Sample, Sink};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Opening,
    Running,
    Sampling,
    Waiting,
    Closing,
    Faulted,
    Terminated,
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Interrupted,
    SampleLimit,
    Aborted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub sweeps: u64,
    pub overruns: u64,
    pub retries: u64,
    pub skipped_reads: u64,
}

#[derive(Debug)]
pub struct LoopReport {
    pub stats: LoopStats,
    pub reason: EndReason,
    /// The error that ended the run in strict mode
    pub fault: Option<BusError>,
}

impl LoopReport {
    pub fn exit_code(&self) -> u8 {
        match self.reason {
            EndReason::Interrupted | EndReason::SampleLimit => 0,
            EndReason::Aborted => 1,
        }
    }
}

/// Fixed-cadence schedule anchored at `start`: deadlines are `start + n * interval`
#[derive(Debug, Clone)]
pub struct Ticker {
    start: Instant,
    interval: Duration,
    current: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Sleep until this deadline
    Wait(Instant),
    /// The sweep ran past its slot by this much; go again now
    Overrun(Duration),
}

impl Ticker {
    pub fn new(start: Instant, interval: Duration) -> Self {
        Self {
            start,
            interval,
            current: start,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Move to the next slot after a sweep that finished at `now`
    pub fn advance(&mut self, now: Instant) -> Tick {
        let next = self.current + self.interval;
        if now <= next {
            self.current = next;
            return Tick::Wait(next);
        }
        // Realign: the sweep about to run owns the latest slot at or before now
        let slots = (now - self.start).as_nanos() / self.interval.as_nanos().max(1);
        let offset = self.interval.as_nanos().saturating_mul(slots);
        self.current = self.start + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX));
        Tick::Overrun(now - next)
    }
}

/// Loop knobs derived from `[sampling]`
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    pub status_interval: Duration,
    pub sample_count: Option<u64>,
    pub block_reads: bool,
    pub policy: FaultPolicy,
}

impl LoopSettings {
    pub fn from_config(config: &SamplingConfig) -> Self {
        Self {
            interval: config.interval(),
            status_interval: config.status_interval(),
            sample_count: config.sample_count,
            block_reads: config.block_reads,
            policy: FaultPolicy::from_config(config),
        }
    }
}

enum Sweep {
    Complete(Vec<u16>),
    Interrupted,
    Aborted(BusError),
}

// Read outcome after the fault policy had its say
enum Read<T> {
    Value(T),
    Interrupted,
    Aborted(BusError),
}

pub struct SamplingLoop<S: Sink> {
    transport: Box<dyn BusTransport>,
    sink: S,
    map: RegisterMap,
    runs: Vec<RegisterRun>,
    settings: LoopSettings,
    shutdown: watch::Receiver<bool>,
    state: LoopState,
    stats: LoopStats,
    last_status: Option<Instant>,
}

impl<S: Sink> SamplingLoop<S> {
    pub fn new(
        transport: Box<dyn BusTransport>,
        sink: S,
        map: RegisterMap,
        settings: LoopSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let runs = if settings.block_reads {
            map.runs(PAGE_WORDS)
        } else {
            map.runs(1)
        };
        Self {
            transport,
            sink,
            map,
            runs,
            settings,
            shutdown,
            state: LoopState::Idle,
            stats: LoopStats::default(),
            last_status: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn enter(&mut self, state: LoopState) {
        trace!("[sampler] {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until interrupted, the sample limit, or an aborting fault. The
    /// transport is closed on every path out.
    pub async fn run(&mut self) -> LoggerResult<LoopReport> {
        let outcome = self.drive().await;

        self.enter(LoopState::Closing);
        let flushed = self.sink.flush();
        if let Err(e) = self.transport.close() {
            warn!("[sampler] closing {} failed: {}", self.transport.name(), e);
        }
        self.enter(LoopState::Terminated);

        let (reason, fault) = outcome?;
        flushed?;
        info!(
            "[sampler] stopped ({:?}): {} records, {} overruns, {} retries, {} skipped reads",
            reason,
            self.stats.sweeps,
            self.stats.overruns,
            self.stats.retries,
            self.stats.skipped_reads
        );
        Ok(LoopReport {
            stats: self.stats,
            reason,
            fault,
        })
    }

    async fn drive(&mut self) -> LoggerResult<(EndReason, Option<BusError>)> {
        self.enter(LoopState::Opening);
        self.sink.write_header(&self.map.column_names())?;
        let mut ticker = Ticker::new(Instant::now(), self.settings.interval);
        self.enter(LoopState::Running);
        debug!(
            "[sampler] {} registers every {:?} on {}",
            self.map.len(),
            self.settings.interval,
            self.transport.name()
        );

        loop {
            self.enter(LoopState::Sampling);
            let timestamp = Utc::now().timestamp_micros() as f64 / 1e6;
            let values = match self.sweep().await {
                Sweep::Complete(values) => values,
                Sweep::Interrupted => return Ok((EndReason::Interrupted, None)),
                Sweep::Aborted(e) => {
                    self.enter(LoopState::Faulted);
                    error!("[sampler] aborting on bus error: {}", e);
                    return Ok((EndReason::Aborted, Some(e)));
                }
            };
            self.sink.write_row(&Sample { timestamp, values })?;
            self.stats.sweeps += 1;
            self.report_progress();

            if self
                .settings
                .sample_count
                .is_some_and(|limit| self.stats.sweeps >= limit)
            {
                return Ok((EndReason::SampleLimit, None));
            }

            self.enter(LoopState::Waiting);
            match ticker.advance(Instant::now()) {
                Tick::Wait(deadline) => {
                    let interrupted = tokio::select! {
                        _ = sleep_until(deadline) => false,
                        _ = wait_for_shutdown(&mut self.shutdown) => true,
                    };
                    if interrupted {
                        return Ok((EndReason::Interrupted, None));
                    }
                }
                Tick::Overrun(late) => {
                    self.stats.overruns += 1;
                    warn!(
                        "[sampler] sweep overran the {:?} interval by {:?}",
                        ticker.interval(),
                        late
                    );
                    if self.shutdown_requested() {
                        return Ok((EndReason::Interrupted, None));
                    }
                }
            }
        }
    }

    fn report_progress(&mut self) {
        let now = Instant::now();
        let due = self
            .last_status
            .map_or(true, |last| now.duration_since(last) >= self.settings.status_interval);
        if due {
            info!("[sampler] {} records logged", self.stats.sweeps);
            self.last_status = Some(now);
        }
    }

    async fn sweep(&mut self) -> Sweep {
        let mut values = vec![SENTINEL; self.map.len()];
        for run_index in 0..self.runs.len() {
            // Never interrupt a transaction, only the gaps between them
            tokio::task::yield_now().await;
            if self.shutdown_requested() {
                return Sweep::Interrupted;
            }

            let run = self.runs[run_index];
            if run.words > 1 {
                match self
                    .transport
                    .read_words(run.target, run.register, run.words)
                    .await
                {
                    Ok(words) if words.len() == run.words => {
                        for index in run.first..run.first + run.len {
                            values[index] = words[self.map.offset_in_run(&run, index)];
                        }
                        continue;
                    }
                    Ok(words) => debug!(
                        "[sampler] block read at 0x{:02x} returned {} of {} words",
                        run.register,
                        words.len(),
                        run.words
                    ),
                    Err(e @ BusError::BusUnavailable { .. }) => return Sweep::Aborted(e),
                    Err(e) => debug!(
                        "[sampler] block read at 0x{:02x}/0x{:02x} failed, reading singly: {}",
                        run.target, run.register, e
                    ),
                }
            }

            for index in run.first..run.first + run.len {
                if index > run.first {
                    tokio::task::yield_now().await;
                    if self.shutdown_requested() {
                        return Sweep::Interrupted;
                    }
                }
                match self.read_entry(index).await {
                    Read::Value(value) => values[index] = value,
                    Read::Interrupted => return Sweep::Interrupted,
                    Read::Aborted(e) => return Sweep::Aborted(e),
                }
            }
        }
        Sweep::Complete(values)
    }

    /// One register through the fault policy
    async fn read_entry(&mut self, index: usize) -> Read<u16> {
        let (target, register) = {
            let entry = &self.map.entries()[index];
            (entry.target(), entry.register())
        };
        let mut attempt = 0;
        loop {
            let err = match self.transport.read_register(target, register).await {
                Ok(value) => return Read::Value(value),
                Err(e) => e,
            };
            match self.settings.policy.handle(&err, attempt) {
                FaultAction::Retry => {
                    self.stats.retries += 1;
                    attempt += 1;
                    debug!(
                        "[sampler] retry {} for {}: {}",
                        attempt,
                        self.map.entries()[index].column_name(),
                        err
                    );
                    tokio::task::yield_now().await;
                    if self.shutdown_requested() {
                        return Read::Interrupted;
                    }
                }
                FaultAction::SkipRegister => {
                    self.stats.skipped_reads += 1;
                    warn!(
                        "[sampler] {} unreadable, logging {:04X}: {}",
                        self.map.entries()[index].column_name(),
                        SENTINEL,
                        err
                    );
                    return Read::Value(SENTINEL);
                }
                FaultAction::Abort => return Read::Aborted(err),
            }
        }
    }
}

/// Resolves once `true` is published; never resolves if the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Check the link before creating any output: read the first map entry once
pub async fn probe(transport: &mut dyn BusTransport, map: &RegisterMap) -> LoggerResult<()> {
    let Some(entry) = map.entries().first() else {
        return Ok(());
    };
    match transport.read_register(entry.target(), entry.register()).await {
        Ok(value) => {
            debug!("[sampler] probe {} = {:04X}", entry.column_name(), value);
            Ok(())
        }
        Err(source) => Err(LoggerError::ProbeFailed {
            target: entry.target(),
            source,
        }),
    }
}
