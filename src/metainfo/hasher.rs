//! Fixed-size worker pool for SHA-1 piece hashing.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};

use super::error::MetainfoError;
use crate::config::HashingConfig;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A pool of named worker threads running CPU-bound jobs, mostly piece hashing.
///
/// Dropping the pool closes the job queue and joins every worker once the
/// queued jobs are done.
pub struct HashingPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    config: HashingConfig,
}

/// A digest that a worker is computing.
#[derive(Debug)]
pub struct PendingDigest {
    rx: Receiver<[u8; 20]>,
}

impl PendingDigest {
    /// Blocks until the digest arrives.
    ///
    /// # Errors
    ///
    /// [`MetainfoError::SlowHashing`] when `timeout` elapses first,
    /// [`MetainfoError::Hashing`] when the worker died before replying.
    pub fn wait(self, timeout: Duration) -> Result<[u8; 20], MetainfoError> {
        match self.rx.recv_timeout(timeout) {
            Ok(digest) => Ok(digest),
            Err(RecvTimeoutError::Timeout) => Err(MetainfoError::SlowHashing(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(MetainfoError::Hashing),
        }
    }
}

impl HashingPool {
    pub fn new(config: &HashingConfig) -> io::Result<Self> {
        let threads = config.threads.max(1);
        let (tx, rx) = channel::unbounded::<Job>();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());

        let workers = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                let dispatch = dispatch.clone();
                std::thread::Builder::new()
                    .name(format!("hasher-{i}"))
                    .spawn(move || {
                        tracing::dispatcher::with_default(&dispatch, || {
                            for job in rx.iter() {
                                // A panicking job drops its reply sender, which
                                // the waiter observes as a worker failure.
                                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                    warn!("hashing job panicked");
                                }
                            }
                        })
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        debug!(threads, "hashing pool started");
        Ok(Self {
            jobs: Some(tx),
            workers,
            config: HashingConfig {
                threads,
                task_timeout: config.task_timeout,
            },
        })
    }

    pub fn threads(&self) -> usize {
        self.config.threads
    }

    pub fn task_timeout(&self) -> Duration {
        self.config.task_timeout
    }

    /// Runs `job` on a worker thread.
    pub fn execute<F>(&self, job: F) -> Result<(), MetainfoError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs
            .as_ref()
            .ok_or(MetainfoError::Hashing)?
            .send(Box::new(job))
            .map_err(|_| MetainfoError::Hashing)
    }

    /// Queues `data` for hashing; the worker owns the buffer.
    pub fn submit(&self, data: Vec<u8>) -> Result<PendingDigest, MetainfoError> {
        let (tx, rx) = channel::bounded(1);
        self.execute(move || {
            let _ = tx.send(Sha1::digest(&data).into());
        })?;
        Ok(PendingDigest { rx })
    }

    /// Hashes the byte stream formed by concatenating `files`, returning the
    /// 20-byte digests of each `piece_length` slice in order.
    ///
    /// At most [`threads`](Self::threads) pieces are in flight; once that many
    /// are pending they are all collected in submission order, so the output
    /// does not depend on which worker finishes first.
    pub fn hash_files<P: AsRef<Path>>(
        &self,
        files: &[P],
        piece_length: u64,
    ) -> Result<Vec<u8>, MetainfoError> {
        let piece_length = usize::try_from(piece_length)
            .ok()
            .filter(|&n| n > 0)
            .ok_or(MetainfoError::InvalidField("piece length"))?;

        let mut digests = Vec::new();
        let mut pending: VecDeque<PendingDigest> = VecDeque::with_capacity(self.threads());
        let mut buffer = vec![0u8; piece_length];
        let mut filled = 0;
        let mut total = 0u64;

        for path in files {
            let path = path.as_ref();
            trace!(file = %path.display(), "hashing");
            let mut file = File::open(path)?;

            loop {
                let n = match file.read(&mut buffer[filled..]) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                filled += n;
                total += n as u64;

                if filled == piece_length {
                    let piece = std::mem::replace(&mut buffer, vec![0u8; piece_length]);
                    pending.push_back(self.submit(piece)?);
                    filled = 0;

                    if pending.len() >= self.threads() {
                        self.drain(&mut pending, &mut digests)?;
                    }
                }
            }
        }

        if filled > 0 {
            buffer.truncate(filled);
            pending.push_back(self.submit(buffer)?);
        }
        self.drain(&mut pending, &mut digests)?;

        debug!(
            bytes = total,
            pieces = digests.len() / 20,
            "hashed {} file(s)",
            files.len()
        );
        Ok(digests)
    }

    fn drain(
        &self,
        pending: &mut VecDeque<PendingDigest>,
        digests: &mut Vec<u8>,
    ) -> Result<(), MetainfoError> {
        while let Some(digest) = pending.pop_front() {
            digests.extend_from_slice(&digest.wait(self.task_timeout())?);
        }
        Ok(())
    }
}

impl Drop for HashingPool {
    fn drop(&mut self) {
        self.jobs.take();
        let current = std::thread::current().id();
        for worker in self.workers.drain(..) {
            // The last reference may be released by a job on a worker.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for HashingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashingPool")
            .field("threads", &self.config.threads)
            .field("task_timeout", &self.config.task_timeout)
            .finish()
    }
}
