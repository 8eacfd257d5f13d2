//! Asynchronous SQL job pool
//!
//! Jobs submitted from the game loop flow through two worker threads in a fixed
//! order:
//!
//! ```text
//! game loop --jobs--> backup worker --jobs--> primary worker
//! ```
//!
//! The backup worker sees every job first and stores fault-tolerant writes in
//! the local backup database before the primary worker attempts them against
//! the primary store. The primary worker owns the read replicas, the write
//! connection and its own backup handle; nothing else touches them.
//!
//! Submitting never blocks. Results are published through [`SqlResult`], which
//! the game loop polls.

use super::{ConnectStatus, DbConnection, DbError};
use log::{debug, error, info, warn};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Slot a registered backend is installed into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    WriteBackup,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Read => write!(f, "READ"),
            Mode::Write => write!(f, "WRITE"),
            Mode::WriteBackup => write!(f, "WRITE_BACKUP"),
        }
    }
}

/// Tells a fault-tolerant write function which store it is writing to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTag {
    /// Primary store
    Normal,
    /// Backup store, after the primary store accepted the write
    NormalSucceeded,
    /// Backup store, after the primary store rejected the write
    NormalFailed,
    /// Backup store, before the primary store is attempted
    BackupFirst,
}

/// Completion state of a job, polled by the game loop
#[derive(Debug, Default)]
pub struct SqlResult<R> {
    completed: AtomicBool,
    success: AtomicBool,
    data: Mutex<R>,
}

impl<R> SqlResult<R> {
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn success(&self) -> bool {
        self.success.load(Ordering::Acquire)
    }

    /// Output written by the job. Only meaningful once [`SqlResult::completed`]
    /// returns true.
    pub fn data(&self) -> MutexGuard<'_, R> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) trait Completion: Send + Sync {
    fn complete(&self, success: bool);
}

impl<R: Send> Completion for SqlResult<R> {
    fn complete(&self, success: bool) {
        self.success.store(success, Ordering::Release);
        self.completed.store(true, Ordering::Release);
    }
}

/// Read job: fills `R` from the database
pub type ReadFn<Req, R> = fn(&mut dyn DbConnection, &Req, &mut R) -> Result<(), DbError>;
/// Plain write job; `failure` is set when writing to the backup store because
/// the primary store failed
pub type WriteFn<Req> = fn(&mut dyn DbConnection, &Req, bool) -> Result<(), DbError>;
/// Fault-tolerant write job
pub type WriteFaultTolerantFn<Req> = fn(&mut dyn DbConnection, &Req, WriteTag) -> Result<(), DbError>;

type ReadExec = Box<dyn FnMut(&mut dyn DbConnection) -> Result<(), DbError> + Send>;
type WriteExec = Box<dyn FnMut(&mut dyn DbConnection, WriteTag) -> Result<(), DbError> + Send>;

/// One unit of work travelling through the pool
pub(crate) enum SqlJob {
    Read {
        id: u64,
        name: &'static str,
        exec: ReadExec,
        result: Arc<dyn Completion>,
    },
    Write {
        id: u64,
        name: &'static str,
        exec: WriteExec,
        result: Arc<dyn Completion>,
        fault_tolerant: bool,
    },
    RegisterBackend {
        mode: Mode,
        connection: Box<dyn DbConnection>,
    },
    PrintStatus {
        mode: Mode,
    },
    Shutdown,
}

impl SqlJob {
    fn fail(self) {
        match self {
            SqlJob::Read { result, .. } | SqlJob::Write { result, .. } => result.complete(false),
            _ => {}
        }
    }
}

/// Connects, runs `job`, then always unlocks and disconnects. Panics and
/// driver errors are turned into `Err`.
fn exec_sql<F>(conn: &mut dyn DbConnection, job: F) -> Result<(), DbError>
where
    F: FnOnce(&mut dyn DbConnection) -> Result<(), DbError>,
{
    match conn.connect() {
        ConnectStatus::Success => {}
        ConnectStatus::InUse => return Err(DbError::InUse),
        ConnectStatus::Failure(e) => return Err(e),
    }
    let result = match panic::catch_unwind(AssertUnwindSafe(|| job(&mut *conn))) {
        Ok(result) => result,
        Err(_) => Err(DbError::Panic),
    };
    if let Err(e) = conn.unlock() {
        warn!("unlock failed: {}", e);
    }
    conn.disconnect();
    result
}

fn backend_name(conn: &dyn DbConnection) -> String {
    format!("{} {}", conn.dialect(), conn.describe())
}

/// Body of the backup thread
fn backup_worker(
    mut rx: UnboundedReceiver<SqlJob>,
    tx: UnboundedSender<SqlJob>,
    backlog: Arc<AtomicUsize>,
) {
    let mut backup: Option<Box<dyn DbConnection>> = None;

    while let Some(mut job) = rx.blocking_recv() {
        match &mut job {
            SqlJob::Write {
                id,
                name,
                exec,
                fault_tolerant: true,
                ..
            } => {
                if let Some(conn) = backup.as_deref_mut() {
                    match exec_sql(conn, |c| exec(c, WriteTag::BackupFirst)) {
                        Ok(()) => debug!("[{}] {} backed up", id, name),
                        Err(e) => warn!("[{}] {} backup failed: {}", id, name, e),
                    }
                }
            }
            SqlJob::RegisterBackend {
                mode: Mode::WriteBackup,
                connection,
            } => {
                backup = Some(connection.copy());
            }
            _ => {}
        }

        let shutdown = matches!(job, SqlJob::Shutdown);
        backlog.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(job)) = tx.send(job) {
            backlog.fetch_sub(1, Ordering::AcqRel);
            error!("primary worker is gone, dropping job");
            job.fail();
            break;
        }
        if shutdown {
            break;
        }
    }
    debug!("backup worker exited");
}

/// State owned by the primary thread
pub(crate) struct PrimaryWorker {
    read: Vec<Box<dyn DbConnection>>,
    write: Option<Box<dyn DbConnection>>,
    backup: Option<Box<dyn DbConnection>>,
    last_read_index: usize,
    fail_mode: bool,
    shutdown: Arc<AtomicBool>,
    backlog: Arc<AtomicUsize>,
    responses: UnboundedSender<String>,
}

impl PrimaryWorker {
    fn new(
        shutdown: Arc<AtomicBool>,
        backlog: Arc<AtomicUsize>,
        responses: UnboundedSender<String>,
    ) -> Self {
        Self {
            read: Vec::new(),
            write: None,
            backup: None,
            last_read_index: 0,
            fail_mode: false,
            shutdown,
            backlog,
            responses,
        }
    }

    fn run(mut self, mut rx: UnboundedReceiver<SqlJob>) {
        while let Some(job) = rx.blocking_recv() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
            if !self.process(job) {
                break;
            }
        }
        debug!("primary worker exited");
    }

    /// Handles one job. Returns false on the shutdown marker.
    pub(crate) fn process(&mut self, job: SqlJob) -> bool {
        match job {
            SqlJob::Read {
                id,
                name,
                mut exec,
                result,
            } => {
                let success = self.run_read(id, name, &mut exec);
                result.complete(success);
            }
            SqlJob::Write {
                id,
                name,
                mut exec,
                result,
                fault_tolerant,
            } => {
                let success = self.run_write(id, name, &mut exec, fault_tolerant);
                result.complete(success);
            }
            SqlJob::RegisterBackend { mode, connection } => {
                info!("registered {} database {}", mode, backend_name(connection.as_ref()));
                match mode {
                    Mode::Read => self.read.push(connection),
                    Mode::Write => self.write = Some(connection),
                    Mode::WriteBackup => self.backup = Some(connection),
                }
            }
            SqlJob::PrintStatus { mode } => self.print_status(mode),
            SqlJob::Shutdown => return false,
        }

        if self.fail_mode && self.backlog.load(Ordering::Acquire) == 0 {
            info!("queue drained, leaving fail mode");
            self.fail_mode = false;
        }
        true
    }

    fn run_read(&mut self, id: u64, name: &str, exec: &mut ReadExec) -> bool {
        let count = self.read.len();
        for offset in 0..count {
            if self.shutdown.load(Ordering::Acquire) {
                info!("[{}] {} dismissed read request during shutdown", id, name);
                return false;
            }
            if self.fail_mode {
                info!("[{}] {} dismissed read request during fail mode", id, name);
                return false;
            }
            let index = (self.last_read_index + offset) % count;
            let conn = self.read[index].as_mut();
            match exec_sql(conn, |c| exec(c)) {
                Ok(()) => {
                    info!("[{}] {} done on read database {}", id, name, index);
                    self.last_read_index = index;
                    return true;
                }
                Err(e) => warn!("[{}] {} failed on read database {}: {}", id, name, index, e),
            }
        }
        error!("[{}] {} failed on all read databases", id, name);
        false
    }

    fn run_write(&mut self, id: u64, name: &str, exec: &mut WriteExec, fault_tolerant: bool) -> bool {
        let mut success = false;

        if self.fail_mode {
            info!("[{}] {} skipping write database during fail mode", id, name);
        } else if let Some(conn) = self.write.as_deref_mut() {
            match exec_sql(conn, |c| exec(c, WriteTag::Normal)) {
                Ok(()) => {
                    info!("[{}] {} done on write database", id, name);
                    success = true;
                }
                Err(e) => {
                    error!("[{}] {} failed on write database: {}", id, name, e);
                    info!("entering fail mode");
                    self.fail_mode = true;
                }
            }
        }

        // plain writes only fall back to the backup when the primary failed
        if !fault_tolerant && success {
            return true;
        }
        let Some(conn) = self.backup.as_deref_mut() else {
            if !success {
                error!("[{}] {} failed, no backup database", id, name);
            }
            return success;
        };
        let tag = if success {
            WriteTag::NormalSucceeded
        } else {
            WriteTag::NormalFailed
        };
        match exec_sql(conn, |c| exec(c, tag)) {
            Ok(()) => {
                debug!("[{}] {} backup reconciled as {:?}", id, name, tag);
                if !success {
                    info!("[{}] {} stored in backup database", id, name);
                }
                true
            }
            Err(e) => {
                error!("[{}] {} failed on backup database: {}", id, name, e);
                success
            }
        }
    }

    fn print_status(&self, mode: Mode) {
        let mut lines = Vec::new();
        match mode {
            Mode::Read => {
                for (index, conn) in self.read.iter().enumerate() {
                    lines.push(format!(
                        "{}-{}[{}]: {}",
                        conn.dialect(),
                        Mode::Read,
                        index,
                        conn.describe()
                    ));
                }
            }
            Mode::Write | Mode::WriteBackup => {
                for (slot, conn) in [(Mode::Write, &self.write), (Mode::WriteBackup, &self.backup)] {
                    if let Some(conn) = conn {
                        lines.push(format!("{}-{}: {}", conn.dialect(), slot, conn.describe()));
                    }
                }
            }
        }
        if lines.is_empty() {
            lines.push(format!("no {} databases registered", mode));
        }
        for line in lines {
            // the receiver only goes away when the pool is dropped
            let _ = self.responses.send(line);
        }
    }

    #[cfg(test)]
    pub(crate) fn last_read_index(&self) -> usize {
        self.last_read_index
    }

    #[cfg(test)]
    pub(crate) fn fail_mode(&self) -> bool {
        self.fail_mode
    }
}

/// Front end of the job pipeline, owned by the game loop
pub struct ConnectionPool {
    jobs: UnboundedSender<SqlJob>,
    responses: UnboundedReceiver<String>,
    shutdown: Arc<AtomicBool>,
    next_id: AtomicU64,
    workers: Vec<JoinHandle<()>>,
}

impl ConnectionPool {
    /// Spawns the backup and primary worker threads
    pub fn new() -> Result<Self, std::io::Error> {
        let (jobs, backup_rx) = mpsc::unbounded_channel();
        let (primary_tx, primary_rx) = mpsc::unbounded_channel();
        let (responses_tx, responses) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let backlog = Arc::new(AtomicUsize::new(0));

        let backup = {
            let backlog = Arc::clone(&backlog);
            thread::Builder::new()
                .name("sql backup".to_string())
                .spawn(move || backup_worker(backup_rx, primary_tx, backlog))?
        };
        let worker = PrimaryWorker::new(Arc::clone(&shutdown), backlog, responses_tx);
        let primary = thread::Builder::new()
            .name("sql primary".to_string())
            .spawn(move || worker.run(primary_rx))?;

        Ok(Self {
            jobs,
            responses,
            shutdown,
            next_id: AtomicU64::new(1),
            workers: vec![backup, primary],
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, job: SqlJob) {
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            warn!("sql workers are not running, job rejected");
            job.fail();
        }
    }

    /// Queues a read job against the read replicas
    pub fn execute<Req, R>(&self, func: ReadFn<Req, R>, request: Req, name: &'static str) -> Arc<SqlResult<R>>
    where
        Req: Send + 'static,
        R: Default + Send + 'static,
    {
        let result = Arc::new(SqlResult::<R>::default());
        let output = Arc::clone(&result);
        let exec: ReadExec = Box::new(move |conn| {
            let mut data = output.data();
            *data = R::default();
            func(conn, &request, &mut data)
        });
        self.submit(SqlJob::Read {
            id: self.next_id(),
            name,
            exec,
            result: Arc::clone(&result) as Arc<dyn Completion>,
        });
        result
    }

    /// Queues a write job; the backup store is only used if the write store
    /// fails
    pub fn execute_write<Req>(&self, func: WriteFn<Req>, request: Req, name: &'static str) -> Arc<SqlResult<()>>
    where
        Req: Send + 'static,
    {
        let exec: WriteExec = Box::new(move |conn, tag| func(conn, &request, tag == WriteTag::NormalFailed));
        self.queue_write(exec, name, false)
    }

    /// Queues a write job that is stored in the backup database before the
    /// write database is attempted
    pub fn execute_write_fault_tolerant<Req>(
        &self,
        func: WriteFaultTolerantFn<Req>,
        request: Req,
        name: &'static str,
    ) -> Arc<SqlResult<()>>
    where
        Req: Send + 'static,
    {
        let exec: WriteExec = Box::new(move |conn, tag| func(conn, &request, tag));
        self.queue_write(exec, name, true)
    }

    fn queue_write(&self, exec: WriteExec, name: &'static str, fault_tolerant: bool) -> Arc<SqlResult<()>> {
        let result = Arc::new(SqlResult::<()>::default());
        self.submit(SqlJob::Write {
            id: self.next_id(),
            name,
            exec,
            result: Arc::clone(&result) as Arc<dyn Completion>,
            fault_tolerant,
        });
        result
    }

    /// Hands a backend to the workers. Construction does no I/O; the worker
    /// connects when the first job runs.
    pub fn register_database(&self, connection: Box<dyn DbConnection>, mode: Mode) {
        self.submit(SqlJob::RegisterBackend { mode, connection });
    }

    /// Asks the primary worker to list the databases of `mode`; the lines
    /// arrive through [`ConnectionPool::get_response`]
    pub fn print(&self, mode: Mode) {
        self.submit(SqlJob::PrintStatus { mode });
    }

    pub fn get_response(&mut self) -> Option<String> {
        self.responses.try_recv().ok()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Lets the workers drain every queued job and waits for both threads.
    /// Blocks the caller.
    pub fn on_shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::Release);
        self.submit(SqlJob::Shutdown);

        let started = Instant::now();
        let mut last_report = started;
        while self.workers.iter().any(|worker| !worker.is_finished()) {
            if last_report.elapsed() >= Duration::from_secs(2) {
                info!(
                    "waiting for database workers to finish ({}s)",
                    started.elapsed().as_secs()
                );
                last_report = Instant::now();
            }
            thread::sleep(Duration::from_millis(10));
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("database worker panicked");
            }
        }
        info!("database workers stopped");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.on_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Dialect, SqlValue};

    type EventLog = Arc<Mutex<Vec<String>>>;

    /// In-memory backend recording what ran on it
    struct MockConnection {
        label: String,
        fail: Arc<AtomicBool>,
        attempts: Arc<AtomicUsize>,
        log: EventLog,
    }

    impl MockConnection {
        fn new(label: &str, log: &EventLog) -> Self {
            Self {
                label: label.to_string(),
                fail: Arc::new(AtomicBool::new(false)),
                attempts: Arc::new(AtomicUsize::new(0)),
                log: Arc::clone(log),
            }
        }

        fn failing(label: &str, log: &EventLog) -> Self {
            let conn = Self::new(label, log);
            conn.fail.store(true, Ordering::SeqCst);
            conn
        }
    }

    impl DbConnection for MockConnection {
        fn describe(&self) -> String {
            self.label.clone()
        }
        fn prefix(&self) -> &str {
            "record"
        }
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }
        fn copy(&self) -> Box<dyn DbConnection> {
            Box::new(MockConnection {
                label: self.label.clone(),
                fail: Arc::clone(&self.fail),
                attempts: Arc::clone(&self.attempts),
                log: Arc::clone(&self.log),
            })
        }
        fn connect(&mut self) -> ConnectStatus {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                ConnectStatus::Failure(DbError::Job(format!("{} is down", self.label)))
            } else {
                ConnectStatus::Success
            }
        }
        fn disconnect(&mut self) {}
        fn lock(&mut self, _table: &str) -> Result<(), DbError> {
            Ok(())
        }
        fn unlock(&mut self) -> Result<(), DbError> {
            Ok(())
        }
        fn prepare_statement(&mut self, _sql: &str) -> Result<(), DbError> {
            Ok(())
        }
        fn bind(&mut self, _index: usize, _value: SqlValue) -> Result<(), DbError> {
            Ok(())
        }
        fn step(&mut self) -> Result<bool, DbError> {
            Ok(false)
        }
        fn execute_update(&mut self) -> Result<u64, DbError> {
            Ok(1)
        }
        fn column(&self, col: usize) -> Result<&SqlValue, DbError> {
            Err(DbError::Column(col))
        }
        fn add_points(&mut self, _name: &str, _points: i32) -> Result<(), DbError> {
            Ok(())
        }
    }

    fn record_read(conn: &mut dyn DbConnection, log: &EventLog, out: &mut String) -> Result<(), DbError> {
        log.lock().unwrap().push(format!("read {}", conn.describe()));
        *out = conn.describe();
        Ok(())
    }

    fn record_write(conn: &mut dyn DbConnection, req: &(EventLog, usize), tag: WriteTag) -> Result<(), DbError> {
        req.0
            .lock()
            .unwrap()
            .push(format!("write {} {} {:?}", req.1, conn.describe(), tag));
        Ok(())
    }

    fn plain_write(conn: &mut dyn DbConnection, log: &EventLog, failure: bool) -> Result<(), DbError> {
        log.lock()
            .unwrap()
            .push(format!("plain {} failure={}", conn.describe(), failure));
        Ok(())
    }

    fn worker() -> (PrimaryWorker, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = PrimaryWorker::new(
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicUsize::new(0)),
            tx,
        );
        (worker, rx)
    }

    fn read_job(log: &EventLog) -> (SqlJob, Arc<SqlResult<String>>) {
        let result = Arc::new(SqlResult::<String>::default());
        let output = Arc::clone(&result);
        let log = Arc::clone(log);
        let job = SqlJob::Read {
            id: 1,
            name: "read test",
            exec: Box::new(move |conn| record_read(conn, &log, &mut output.data())),
            result: Arc::clone(&result) as Arc<dyn Completion>,
        };
        (job, result)
    }

    fn write_job(log: &EventLog, n: usize) -> (SqlJob, Arc<SqlResult<()>>) {
        let result = Arc::new(SqlResult::<()>::default());
        let req = (Arc::clone(log), n);
        let job = SqlJob::Write {
            id: n as u64,
            name: "write test",
            exec: Box::new(move |conn, tag| record_write(conn, &req, tag)),
            result: Arc::clone(&result) as Arc<dyn Completion>,
            fault_tolerant: true,
        };
        (job, result)
    }

    fn register(worker: &mut PrimaryWorker, mode: Mode, conn: MockConnection) {
        assert!(worker.process(SqlJob::RegisterBackend {
            mode,
            connection: Box::new(conn),
        }));
    }

    #[test]
    fn test_read_round_robin_skips_failing_replicas() {
        let log = EventLog::default();
        let (mut worker, _responses) = worker();
        register(&mut worker, Mode::Read, MockConnection::failing("replica0", &log));
        register(&mut worker, Mode::Read, MockConnection::failing("replica1", &log));
        register(&mut worker, Mode::Read, MockConnection::new("replica2", &log));

        let (job, result) = read_job(&log);
        worker.process(job);

        assert!(result.completed());
        assert!(result.success());
        assert_eq!(*result.data(), "replica2");
        assert_eq!(worker.last_read_index(), 2);

        // the next read starts at the replica that worked last time
        let (job, result) = read_job(&log);
        worker.process(job);
        assert!(result.success());
        assert_eq!(log.lock().unwrap().as_slice(), ["read replica2", "read replica2"]);
    }

    #[test]
    fn test_read_fails_without_replicas() {
        let log = EventLog::default();
        let (mut worker, _responses) = worker();
        let (job, result) = read_job(&log);
        worker.process(job);
        assert!(result.completed());
        assert!(!result.success());
    }

    #[test]
    fn test_fail_mode_dismisses_reads_and_redirects_writes() {
        let log = EventLog::default();
        let (mut worker, _responses) = worker();
        let primary = MockConnection::failing("primary", &log);
        let primary_attempts = Arc::clone(&primary.attempts);
        let replica = MockConnection::new("replica", &log);
        let replica_attempts = Arc::clone(&replica.attempts);
        register(&mut worker, Mode::Write, primary);
        register(&mut worker, Mode::WriteBackup, MockConnection::new("backup", &log));
        register(&mut worker, Mode::Read, replica);

        // pretend more jobs are waiting so fail mode stays active
        worker.backlog.store(3, Ordering::SeqCst);

        let (job, result) = write_job(&log, 1);
        worker.process(job);
        assert!(worker.fail_mode());
        assert!(result.success(), "write must land in the backup");
        assert_eq!(primary_attempts.load(Ordering::SeqCst), 1);

        let (job, result) = read_job(&log);
        worker.process(job);
        assert!(result.completed());
        assert!(!result.success());
        assert_eq!(replica_attempts.load(Ordering::SeqCst), 0);

        let (job, _) = write_job(&log, 2);
        worker.process(job);
        assert_eq!(primary_attempts.load(Ordering::SeqCst), 1);

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["write 1 backup NormalFailed", "write 2 backup NormalFailed"]
        );

        // once nothing is waiting any more the worker leaves fail mode
        worker.backlog.store(0, Ordering::SeqCst);
        let (job, _) = read_job(&log);
        worker.process(job);
        assert!(!worker.fail_mode());
    }

    #[test]
    fn test_write_reconciles_backup_on_success() {
        let log = EventLog::default();
        let (mut worker, _responses) = worker();
        register(&mut worker, Mode::Write, MockConnection::new("primary", &log));
        register(&mut worker, Mode::WriteBackup, MockConnection::new("backup", &log));

        let (job, result) = write_job(&log, 7);
        worker.process(job);
        assert!(result.success());
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["write 7 primary Normal", "write 7 backup NormalSucceeded"]
        );
    }

    #[test]
    fn test_print_status_lists_assignments() {
        let log = EventLog::default();
        let (mut worker, mut responses) = worker();
        register(&mut worker, Mode::Write, MockConnection::new("primary", &log));
        register(&mut worker, Mode::WriteBackup, MockConnection::new("backup", &log));

        worker.process(SqlJob::PrintStatus { mode: Mode::Write });
        assert_eq!(responses.try_recv().unwrap(), "SQLite-WRITE: primary");
        assert_eq!(responses.try_recv().unwrap(), "SQLite-WRITE_BACKUP: backup");

        worker.process(SqlJob::PrintStatus { mode: Mode::Read });
        assert_eq!(responses.try_recv().unwrap(), "no READ databases registered");
    }

    #[test]
    fn test_backup_is_written_before_primary() {
        let log = EventLog::default();
        let mut pool = ConnectionPool::new().unwrap();
        pool.register_database(Box::new(MockConnection::new("backup", &log)), Mode::WriteBackup);
        pool.register_database(Box::new(MockConnection::new("primary", &log)), Mode::Write);

        let results: Vec<_> = (0..10)
            .map(|n| pool.execute_write_fault_tolerant(record_write, (Arc::clone(&log), n), "ordered"))
            .collect();
        pool.on_shutdown();
        assert!(results.iter().all(|r| r.completed() && r.success()));

        let log = log.lock().unwrap();
        for n in 0..10 {
            let position = |entry: String| log.iter().position(|line| *line == entry).unwrap();
            let backed_up = position(format!("write {} backup BackupFirst", n));
            let primary = position(format!("write {} primary Normal", n));
            let reconciled = position(format!("write {} backup NormalSucceeded", n));
            assert!(backed_up < primary);
            assert!(primary < reconciled);
        }
    }

    fn tagged_insert(conn: &mut dyn DbConnection, n: &usize, tag: WriteTag) -> Result<(), DbError> {
        conn.prepare_statement(
            "INSERT INTO record_race(Map, Name, Time, Server, GameId) VALUES (?, ?, ?, ?, ?)",
        )?;
        conn.bind_string(1, &format!("{:?}", tag))?;
        conn.bind_string(2, &n.to_string())?;
        conn.bind_float(3, 12.5)?;
        conn.bind_string(4, "GER")?;
        conn.bind_null(5)?;
        conn.execute_update()?;
        if tag == WriteTag::BackupFirst {
            // keep the backup handle busy while the primary reconciles
            thread::sleep(Duration::from_millis(15));
        }
        Ok(())
    }

    #[test]
    fn test_sqlite_backup_stores_every_write_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.sqlite");
        let log = EventLog::default();
        let mut pool = ConnectionPool::new().unwrap();
        pool.register_database(
            Box::new(crate::db::SqliteConnection::new(&path, "record", true)),
            Mode::WriteBackup,
        );
        pool.register_database(Box::new(MockConnection::new("primary", &log)), Mode::Write);

        let results: Vec<_> = (0..20)
            .map(|n| pool.execute_write_fault_tolerant(tagged_insert, n, "tagged"))
            .collect();
        pool.on_shutdown();
        assert!(results.iter().all(|r| r.completed() && r.success()));

        let db = rusqlite::Connection::open(&path).unwrap();
        for tag in ["BackupFirst", "NormalSucceeded"] {
            let count: i64 = db
                .query_row("SELECT COUNT(*) FROM record_race WHERE Map = ?1", [tag], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 20, "{} rows", tag);
        }
    }

    #[test]
    fn test_plain_write_falls_back_to_backup() {
        let log = EventLog::default();
        let mut pool = ConnectionPool::new().unwrap();
        pool.register_database(Box::new(MockConnection::failing("primary", &log)), Mode::Write);
        pool.register_database(Box::new(MockConnection::new("backup", &log)), Mode::WriteBackup);

        let result = pool.execute_write(plain_write, Arc::clone(&log), "plain");
        pool.on_shutdown();
        assert!(result.success());
        assert_eq!(log.lock().unwrap().as_slice(), ["plain backup failure=true"]);
    }

    #[test]
    fn test_shutdown_drains_all_writes() {
        let log = EventLog::default();
        let mut pool = ConnectionPool::new().unwrap();
        pool.register_database(Box::new(MockConnection::new("primary", &log)), Mode::Write);

        let results: Vec<_> = (0..50)
            .map(|n| pool.execute_write_fault_tolerant(record_write, (Arc::clone(&log), n), "drain"))
            .collect();
        pool.on_shutdown();

        assert!(results.iter().all(|r| r.completed()));
        assert_eq!(log.lock().unwrap().len(), 50);
        assert!(pool.is_shut_down());
    }

    #[test]
    fn test_jobs_after_shutdown_fail_immediately() {
        let log = EventLog::default();
        let mut pool = ConnectionPool::new().unwrap();
        pool.on_shutdown();

        let result = pool.execute(record_read, Arc::clone(&log), "late read");
        assert!(result.completed());
        assert!(!result.success());
    }

    #[test]
    fn test_get_response_from_pool() {
        let log = EventLog::default();
        let mut pool = ConnectionPool::new().unwrap();
        pool.register_database(Box::new(MockConnection::new("replica", &log)), Mode::Read);
        pool.print(Mode::Read);
        pool.on_shutdown();
        assert_eq!(pool.get_response().unwrap(), "SQLite-READ[0]: replica");
        assert!(pool.get_response().is_none());
    }
}
