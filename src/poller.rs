//! Readiness multiplexing over heterogeneous waitable resources.
//!
//! A [`Pollable`] pairs an event source with the events of interest; a
//! poller owns a set of them and reports which are ready. Backends share
//! one contract: the OS `poll(2)` backend (Unix, level-triggered), a
//! cooperative loop backend polling each source once per pass, and
//! [`CustomPoller`] for picking a backend explicitly in tests.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Events: u8 {
        const IN = 0x01;
        const OUT = 0x02;
        const ERR = 0x04;
        const PRI = 0x08;
        const HUP = 0x10;
    }
}

/// What a pollable waits on.
pub enum Source {
    /// An OS file descriptor.
    #[cfg(unix)]
    Fd(std::os::fd::RawFd),
    /// Readiness computed by a callback; the uniform fallback when no OS
    /// primitive fits.
    Callback(Box<dyn FnMut(Events) -> Events>),
    /// An embedder-defined source, resolved by a loop backend's fallback.
    Custom(u64),
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            Source::Fd(fd) => f.debug_tuple("Fd").field(fd).finish(),
            Source::Callback(_) => f.write_str("Callback"),
            Source::Custom(v) => f.debug_tuple("Custom").field(v).finish(),
        }
    }
}

#[derive(Debug)]
pub struct Pollable {
    pub source: Source,
    /// Events of interest.
    pub events: Events,
    /// Events observed by the last poll.
    pub revents: Events,
    pub user_data: u64,
}

impl Pollable {
    pub fn new(source: Source, events: Events) -> Self {
        Pollable {
            source,
            events,
            revents: Events::empty(),
            user_data: 0,
        }
    }

    pub fn with_user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollError {
    /// Nothing ready within the timeout; retry.
    Again,
    /// Interrupted by a signal; retry.
    Interrupted,
    /// No pollables registered, or a source the backend cannot handle.
    Invalid,
    /// OS error code.
    Os(i32),
}

/// One ready pollable, as reported by [`Poller::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// Index of the pollable, as returned by [`Poller::add`].
    pub index: usize,
    pub revents: Events,
    pub user_data: u64,
}

/// The backend-independent poller contract.
pub trait Poller {
    /// Register a pollable; the returned index stays valid until
    /// [`remove`](Self::remove).
    fn add(&mut self, p: Pollable) -> Result<usize, PollError>;
    fn remove(&mut self, index: usize) -> Result<Pollable, PollError>;
    fn reserve(&mut self, more: usize);
    /// Wait up to `timeout_ms` (-1 blocks, 0 does not). Every pollable
    /// ready at the observation instant is reported.
    fn poll(&mut self, timeout_ms: i32) -> Result<&[Ready], PollError>;
}

/// A readiness strategy plugged into [`CustomPoller`].
pub trait PollBackend {
    fn poll(
        &mut self,
        items: &mut [Option<Pollable>],
        timeout_ms: i32,
        ready: &mut Vec<Ready>,
    ) -> Result<(), PollError>;
}

/// Generic poller over an explicit backend.
pub struct CustomPoller<B> {
    backend: B,
    items: Vec<Option<Pollable>>,
    ready: Vec<Ready>,
}

impl<B: PollBackend> CustomPoller<B> {
    pub fn with_backend(backend: B) -> Self {
        CustomPoller {
            backend,
            items: Vec::new(),
            ready: Vec::new(),
        }
    }
}

impl<B: PollBackend + Default> Default for CustomPoller<B> {
    fn default() -> Self {
        Self::with_backend(B::default())
    }
}

impl<B: PollBackend> Poller for CustomPoller<B> {
    fn add(&mut self, p: Pollable) -> Result<usize, PollError> {
        if let Some(free) = self.items.iter().position(Option::is_none) {
            self.items[free] = Some(p);
            return Ok(free);
        }
        self.items.push(Some(p));
        Ok(self.items.len() - 1)
    }

    fn remove(&mut self, index: usize) -> Result<Pollable, PollError> {
        self.items
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(PollError::Invalid)
    }

    fn reserve(&mut self, more: usize) {
        self.items.reserve(more);
        self.ready.reserve(more);
    }

    fn poll(&mut self, timeout_ms: i32) -> Result<&[Ready], PollError> {
        self.ready.clear();
        if self.items.iter().all(Option::is_none) {
            return Err(PollError::Invalid);
        }
        self.backend
            .poll(&mut self.items, timeout_ms, &mut self.ready)?;
        if self.ready.is_empty() {
            return Err(PollError::Again);
        }
        Ok(&self.ready)
    }
}

/// Cooperative backend: evaluates every source once per pass, spinning
/// only when asked to block.
#[derive(Default)]
pub struct LoopBackend {
    /// Resolver for [`Source::Custom`] sources; overrides what the default
    /// pass cannot handle.
    pub fallback: Option<fn(u64, Events) -> Result<Events, PollError>>,
}

fn poll_once(
    p: &mut Pollable,
    fallback: Option<fn(u64, Events) -> Result<Events, PollError>>,
) -> Result<Events, PollError> {
    let interest = p.events;
    match &mut p.source {
        Source::Callback(cb) => Ok(cb(interest) & (interest | Events::ERR | Events::HUP)),
        Source::Custom(v) => match fallback {
            Some(f) => f(*v, interest),
            None => Err(PollError::Invalid),
        },
        #[cfg(unix)]
        Source::Fd(_) => Err(PollError::Invalid),
    }
}

impl PollBackend for LoopBackend {
    fn poll(
        &mut self,
        items: &mut [Option<Pollable>],
        timeout_ms: i32,
        ready: &mut Vec<Ready>,
    ) -> Result<(), PollError> {
        loop {
            let mut err = None;
            for (index, slot) in items.iter_mut().enumerate() {
                let Some(p) = slot else { continue };
                p.revents = Events::empty();
                match poll_once(p, self.fallback) {
                    Ok(revents) if !revents.is_empty() => {
                        p.revents = revents;
                        ready.push(Ready {
                            index,
                            revents,
                            user_data: p.user_data,
                        });
                    }
                    Ok(_) => {}
                    Err(PollError::Again) => {}
                    Err(e) => err = err.or(Some(e)),
                }
            }
            if let Some(e) = err {
                return Err(e);
            }
            if !ready.is_empty() || timeout_ms >= 0 {
                return Ok(());
            }
            // timeout < 0: keep looping until something is ready.
            std::thread::yield_now();
        }
    }
}

pub type LoopPoller = CustomPoller<LoopBackend>;

#[cfg(unix)]
pub use fd::{FdBackend, FdPoller};

#[cfg(unix)]
mod fd {
    use super::*;

    /// `poll(2)` backend; level-triggered. Callback sources are evaluated
    /// inline after the syscall, custom sources are rejected.
    #[derive(Default)]
    pub struct FdBackend;

    pub type FdPoller = CustomPoller<FdBackend>;

    fn interest_to_os(events: Events) -> i16 {
        let mut os = 0i16;
        if events.contains(Events::IN) {
            os |= libc::POLLIN;
        }
        if events.contains(Events::OUT) {
            os |= libc::POLLOUT;
        }
        if events.contains(Events::PRI) {
            os |= libc::POLLPRI;
        }
        os
    }

    fn os_to_events(os: i16) -> Events {
        let mut e = Events::empty();
        if os & libc::POLLIN != 0 {
            e |= Events::IN;
        }
        if os & libc::POLLOUT != 0 {
            e |= Events::OUT;
        }
        if os & libc::POLLPRI != 0 {
            e |= Events::PRI;
        }
        if os & libc::POLLERR != 0 {
            e |= Events::ERR;
        }
        if os & libc::POLLHUP != 0 {
            e |= Events::HUP;
        }
        e
    }

    impl PollBackend for FdBackend {
        fn poll(
            &mut self,
            items: &mut [Option<Pollable>],
            timeout_ms: i32,
            ready: &mut Vec<Ready>,
        ) -> Result<(), PollError> {
            let mut fds: Vec<libc::pollfd> = Vec::with_capacity(items.len());
            let mut index_of: Vec<usize> = Vec::with_capacity(items.len());

            for (index, slot) in items.iter().enumerate() {
                let Some(p) = slot else { continue };
                match p.source {
                    Source::Fd(fd) => {
                        fds.push(libc::pollfd {
                            fd,
                            events: interest_to_os(p.events),
                            revents: 0,
                        });
                        index_of.push(index);
                    }
                    Source::Callback(_) => {}
                    Source::Custom(_) => return Err(PollError::Invalid),
                }
            }

            if !fds.is_empty() {
                sys_poll(&mut fds, timeout_ms)?;
                for (slot_i, fd) in fds.iter().enumerate() {
                    let revents = os_to_events(fd.revents);
                    if revents.is_empty() {
                        continue;
                    }
                    let index = index_of[slot_i];
                    let p = items[index].as_mut().expect("registered");
                    p.revents = revents;
                    ready.push(Ready {
                        index,
                        revents,
                        user_data: p.user_data,
                    });
                }
            }

            // Callback sources piggyback on the same pass.
            for (index, slot) in items.iter_mut().enumerate() {
                let Some(p) = slot else { continue };
                if let Source::Callback(_) = p.source {
                    if let Ok(revents) = super::poll_once(p, None) {
                        if !revents.is_empty() {
                            p.revents = revents;
                            ready.push(Ready {
                                index,
                                revents,
                                user_data: p.user_data,
                            });
                        }
                    }
                }
            }

            Ok(())
        }
    }

    fn sys_poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> Result<usize, PollError> {
        // SAFETY: the kernel reads and writes only the passed array.
        #[allow(unsafe_code)]
        let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if res < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(match errno {
                libc::EINTR => PollError::Interrupted,
                libc::EAGAIN => PollError::Again,
                e => PollError::Os(e),
            });
        }
        Ok(res as usize)
    }
}
