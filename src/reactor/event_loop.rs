use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Buf;
use crossbeam::channel::{self, Receiver, Sender};
use mio::event::{Event, Source};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, trace, warn};

use super::attachment::{AcceptAttachment, Attachment, ConnectAttachment, ReadWriteAttachment};
use super::error::ReactorError;
use super::listener::{ConnectionId, ConnectionInfo, ConnectionListener, Direction, ListenerFactory};
use crate::config::ReactorConfig;
use crate::constants::READ_CHUNK_SIZE;
use crate::throttle::{self, Throttle, Unthrottled};

const WAKER: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 1024;
/// Reads per connection per tick before other connections get a turn.
const MAX_READS_PER_TICK: usize = 16;

enum Task {
    Connect {
        addr: SocketAddr,
        listener: Box<dyn ConnectionListener>,
    },
    Close(ConnectionId),
    Execute(Box<dyn FnOnce() + Send>),
}

/// Every dispatch flushes pending output, so write readiness carries no
/// extra information.
#[derive(Debug, Clone, Copy, Default)]
struct Readiness {
    readable: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
        }
    }
}

/// Cloneable, thread-safe access to a running [`Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    tasks: Sender<Task>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Connect { addr, .. } => write!(f, "Connect({addr})"),
            Task::Close(id) => write!(f, "Close({id})"),
            Task::Execute(_) => f.write_str("Execute"),
        }
    }
}

impl ReactorHandle {
    fn submit(&self, task: Task) -> Result<(), ReactorError> {
        if self.is_shut_down() {
            return Err(ReactorError::Shutdown);
        }
        self.tasks.send(task).map_err(|_| ReactorError::Shutdown)?;
        self.waker.wake()?;
        Ok(())
    }

    /// Starts a non-blocking connect. The listener is told about the outcome
    /// on the reactor thread.
    pub fn connect(
        &self,
        addr: SocketAddr,
        listener: Box<dyn ConnectionListener>,
    ) -> Result<(), ReactorError> {
        self.submit(Task::Connect { addr, listener })
    }

    /// Closes a connection after flushing what its listener has queued.
    pub fn close(&self, id: ConnectionId) -> Result<(), ReactorError> {
        self.submit(Task::Close(id))
    }

    /// Runs `job` on the reactor thread during the next tick.
    pub fn execute<F>(&self, job: F) -> Result<(), ReactorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::Execute(Box::new(job)))
    }

    /// Asks the reactor to stop. Every open connection gets `on_disconnect`.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            let _ = self.waker.wake();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// The selector loop. Build it, register listening sockets, then
/// [`spawn`](Reactor::spawn) it onto its own thread.
pub struct Reactor {
    poll: Poll,
    attachments: HashMap<Token, Attachment>,
    next_token: usize,
    tasks: Receiver<Task>,
    handle: ReactorHandle,
    config: ReactorConfig,
    throttle: Arc<dyn Throttle>,
    scratch: Vec<u8>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = channel::unbounded();

        Ok(Self {
            poll,
            attachments: HashMap::new(),
            next_token: 0,
            tasks: rx,
            handle: ReactorHandle {
                tasks: tx,
                waker,
                shutdown: Arc::new(AtomicBool::new(false)),
            },
            config,
            throttle: Arc::new(Unthrottled),
            scratch: vec![0; READ_CHUNK_SIZE],
        })
    }

    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Binds a listening socket. Accepted connections get a listener from
    /// `factory`.
    pub fn listen<F>(&mut self, addr: SocketAddr, factory: F) -> io::Result<SocketAddr>
    where
        F: ListenerFactory + 'static,
    {
        let mut socket = TcpListener::bind(addr)?;
        let local_addr = socket.local_addr()?;
        let token = self.next_token();
        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;
        self.attachments.insert(
            token,
            Attachment::Accept(AcceptAttachment {
                socket,
                factory: Box::new(factory),
            }),
        );
        info!(%local_addr, "listening for connections");
        Ok(local_addr)
    }

    /// Runs the loop on a thread named `reactor`, carrying the caller's
    /// tracing dispatcher along.
    pub fn spawn(self) -> io::Result<JoinHandle<io::Result<()>>> {
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        thread::Builder::new()
            .name("reactor".into())
            .spawn(move || tracing::dispatcher::with_default(&dispatch, || self.run()))
    }

    /// Runs the loop on the current thread until shutdown.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        debug!("reactor started");
        let result = self.event_loop(&mut events);
        if let Err(e) = &result {
            warn!(error = %e, "reactor selector failed");
        }
        self.close_all();
        debug!("reactor stopped");
        result
    }

    fn event_loop(&mut self, events: &mut Events) -> io::Result<()> {
        loop {
            if self.handle.is_shut_down() {
                return Ok(());
            }

            if let Err(e) = self.poll.poll(events, Some(self.config.select_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                self.on_event(event.token(), Readiness::from(event));
            }

            self.run_tasks();
            self.sweep();
        }
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn on_event(&mut self, token: Token, ready: Readiness) {
        let Some(attachment) = self.attachments.remove(&token) else {
            return;
        };

        let next = match attachment {
            Attachment::Accept(mut accept) => {
                self.accept_all(&mut accept);
                Some(Attachment::Accept(accept))
            }
            Attachment::Connect(connect) => self.finish_connect(token, connect),
            Attachment::ReadWrite(rw) => self.service(token, rw, ready).map(Attachment::ReadWrite),
        };

        if let Some(next) = next {
            self.attachments.insert(token, next);
        }
    }

    fn accept_all(&mut self, accept: &mut AcceptAttachment) {
        loop {
            match accept.socket.accept() {
                Ok((mut stream, peer_addr)) => {
                    let Some(listener) = accept.factory.new_listener(peer_addr) else {
                        debug!(%peer_addr, "refused inbound connection");
                        continue;
                    };
                    let token = self.next_token();
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(%peer_addr, error = %e, "failed to register inbound connection");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    if let Some(rw) =
                        self.establish(token, stream, peer_addr, Direction::Inbound, listener)
                    {
                        self.attachments.insert(token, Attachment::ReadWrite(rw));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn start_connect(&mut self, addr: SocketAddr, mut listener: Box<dyn ConnectionListener>) {
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(source) => {
                debug!(%addr, error = %source, "connect failed");
                listener.on_error(&ReactorError::Connect { addr, source });
                return;
            }
        };

        let token = self.next_token();
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            listener.on_error(&ReactorError::Io(e));
            return;
        }

        trace!(%addr, token = token.0, "connecting");
        self.attachments.insert(
            token,
            Attachment::Connect(ConnectAttachment {
                stream,
                target: addr,
                listener,
                started: Instant::now(),
                timeout: self.config.connect_timeout,
            }),
        );
    }

    fn finish_connect(&mut self, token: Token, mut connect: ConnectAttachment) -> Option<Attachment> {
        let failure = match connect.stream.take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => None,
        };

        let peer_addr = match failure {
            Some(e) => Err(e),
            None => connect.stream.peer_addr(),
        };

        let peer_addr = match peer_addr {
            Ok(addr) => addr,
            // mio may report connect readiness spuriously; keep waiting
            // until the connect timeout.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                return Some(Attachment::Connect(connect));
            }
            Err(source) => {
                debug!(addr = %connect.target, error = %source, "connect failed");
                self.deregister(&mut connect.stream);
                connect.listener.on_error(&ReactorError::Connect {
                    addr: connect.target,
                    source,
                });
                return None;
            }
        };

        let ConnectAttachment {
            mut stream,
            mut listener,
            ..
        } = connect;
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut stream, token, Interest::READABLE)
        {
            self.deregister(&mut stream);
            listener.on_error(&ReactorError::Io(e));
            return None;
        }
        let _ = stream.set_nodelay(true);

        self.establish(token, stream, peer_addr, Direction::Outbound, listener)
            .map(Attachment::ReadWrite)
    }

    /// Hands a registered stream to its listener and flushes whatever the
    /// listener queued in response.
    fn establish(
        &mut self,
        token: Token,
        stream: TcpStream,
        peer_addr: SocketAddr,
        direction: Direction,
        listener: Box<dyn ConnectionListener>,
    ) -> Option<ReadWriteAttachment> {
        let info = ConnectionInfo {
            id: ConnectionId(token.0),
            peer_addr,
            direction,
        };
        let mut rw = ReadWriteAttachment {
            stream,
            info,
            listener,
            last_activity: Instant::now(),
            timeout: self.config.idle_timeout,
            interest: Interest::READABLE,
            read_deferred: false,
        };

        debug!(id = %info.id, %peer_addr, ?direction, "connection established");
        if let Err(e) = rw.listener.on_connection_established(&info) {
            self.finish(rw, Some(ReactorError::Rejected(e)));
            return None;
        }

        self.service(token, rw, Readiness::default())
    }

    /// Reads what is available, flushes pending output and updates interest.
    fn service(
        &mut self,
        token: Token,
        mut rw: ReadWriteAttachment,
        ready: Readiness,
    ) -> Option<ReadWriteAttachment> {
        if ready.readable || rw.read_deferred {
            match self.read(&mut rw) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(id = %rw.info.id, "connection closed by peer");
                    self.finish(rw, None);
                    return None;
                }
                Err(error) => {
                    self.finish(rw, Some(error));
                    return None;
                }
            }
        }

        let flushed = self
            .flush(&mut rw)
            .and_then(|()| self.update_interest(token, &mut rw));
        if let Err(e) = flushed {
            self.finish(rw, Some(ReactorError::Io(e)));
            return None;
        }

        Some(rw)
    }

    /// Returns `Ok(false)` on end of stream.
    fn read(&mut self, rw: &mut ReadWriteAttachment) -> Result<bool, ReactorError> {
        rw.read_deferred = false;

        for _ in 0..MAX_READS_PER_TICK {
            let budget = self
                .throttle
                .admit(throttle::Direction::Download, self.scratch.len());
            if budget == 0 {
                rw.read_deferred = true;
                return Ok(true);
            }

            match rw.stream.read(&mut self.scratch[..budget]) {
                Ok(0) => {
                    self.throttle.refund(throttle::Direction::Download, budget);
                    return Ok(false);
                }
                Ok(n) => {
                    self.throttle
                        .refund(throttle::Direction::Download, budget - n);
                    rw.last_activity = Instant::now();
                    rw.listener
                        .on_data_received(&self.scratch[..n])
                        .map_err(ReactorError::Rejected)?;
                }
                Err(e) => {
                    self.throttle.refund(throttle::Direction::Download, budget);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Ok(true),
                        io::ErrorKind::Interrupted => {}
                        _ => return Err(ReactorError::Io(e)),
                    }
                }
            }
        }

        rw.read_deferred = true;
        Ok(true)
    }

    fn flush(&self, rw: &mut ReadWriteAttachment) -> io::Result<()> {
        loop {
            let pending = rw.listener.outbound();
            if pending.is_empty() {
                return Ok(());
            }
            let budget = self
                .throttle
                .admit(throttle::Direction::Upload, pending.len());
            if budget == 0 {
                return Ok(());
            }

            match rw.stream.write(&pending[..budget]) {
                Ok(0) => {
                    self.throttle.refund(throttle::Direction::Upload, budget);
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => {
                    pending.advance(n);
                    self.throttle.refund(throttle::Direction::Upload, budget - n);
                }
                Err(e) => {
                    self.throttle.refund(throttle::Direction::Upload, budget);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => return Ok(()),
                        io::ErrorKind::Interrupted => {}
                        _ => return Err(e),
                    }
                }
            }
        }
    }

    /// Write interest is held exactly while output is pending.
    fn update_interest(&self, token: Token, rw: &mut ReadWriteAttachment) -> io::Result<()> {
        let wanted = if rw.listener.outbound().is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if wanted != rw.interest {
            self.poll
                .registry()
                .reregister(&mut rw.stream, token, wanted)?;
            rw.interest = wanted;
        }
        Ok(())
    }

    fn deregister<S: Source>(&self, source: &mut S) {
        let _ = self.poll.registry().deregister(source);
    }

    /// Delivers the terminal callback and drops the socket.
    fn finish(&self, mut rw: ReadWriteAttachment, error: Option<ReactorError>) {
        self.deregister(&mut rw.stream);
        match error {
            Some(error) => {
                debug!(id = %rw.info.id, %error, "connection failed");
                rw.listener.on_error(&error);
            }
            None => rw.listener.on_disconnect(),
        }
    }

    fn run_tasks(&mut self) {
        // Only what was queued before this tick; jobs may queue more.
        for _ in 0..self.tasks.len() {
            let Ok(task) = self.tasks.try_recv() else {
                break;
            };
            trace!(?task, "running task");
            match task {
                Task::Connect { addr, listener } => self.start_connect(addr, listener),
                Task::Close(id) => self.close(id),
                Task::Execute(job) => {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!("reactor task panicked");
                    }
                }
            }
        }
    }

    fn close(&mut self, id: ConnectionId) {
        let token = Token(id.0);
        match self.attachments.remove(&token) {
            Some(Attachment::ReadWrite(mut rw)) => {
                let _ = self.flush(&mut rw);
                debug!(%id, "closing connection");
                self.finish(rw, None);
            }
            Some(Attachment::Connect(mut connect)) => {
                self.deregister(&mut connect.stream);
                connect.listener.on_disconnect();
            }
            Some(accept @ Attachment::Accept(_)) => {
                self.attachments.insert(token, accept);
            }
            None => trace!(%id, "close for unknown connection"),
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let tokens: Vec<Token> = self.attachments.keys().copied().collect();

        for token in tokens {
            let Some(attachment) = self.attachments.remove(&token) else {
                continue;
            };

            let next = match attachment {
                Attachment::Accept(accept) => Some(Attachment::Accept(accept)),
                Attachment::Connect(mut connect) => {
                    if connect.expired(now) {
                        debug!(addr = %connect.target, "connect timed out");
                        self.deregister(&mut connect.stream);
                        connect
                            .listener
                            .on_error(&ReactorError::Timeout(connect.timeout));
                        None
                    } else {
                        Some(Attachment::Connect(connect))
                    }
                }
                Attachment::ReadWrite(rw) => {
                    if rw.idle(now) {
                        let timeout = rw.timeout;
                        self.finish(rw, Some(ReactorError::Timeout(timeout)));
                        None
                    } else {
                        self.service(token, rw, Readiness::default())
                            .map(Attachment::ReadWrite)
                    }
                }
            };

            if let Some(next) = next {
                self.attachments.insert(token, next);
            }
        }
    }

    fn close_all(&mut self) {
        let attachments = std::mem::take(&mut self.attachments);
        for attachment in attachments.into_values() {
            match attachment {
                Attachment::Accept(mut accept) => self.deregister(&mut accept.socket),
                Attachment::Connect(mut connect) => {
                    self.deregister(&mut connect.stream);
                    connect.listener.on_disconnect();
                }
                Attachment::ReadWrite(mut rw) => {
                    let _ = self.flush(&mut rw);
                    self.finish(rw, None);
                }
            }
        }

        while let Ok(task) = self.tasks.try_recv() {
            if let Task::Connect { mut listener, .. } = task {
                listener.on_error(&ReactorError::Shutdown);
            }
        }
    }
}
