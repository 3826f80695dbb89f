//! Readiness event loop shared by all processes: epoll registration by
//! token, a monotonic deadline set feeding the wait timeout, and the
//! signalfd setup used by every role.

use std::{
    collections::{BTreeSet, HashMap},
    os::fd::AsFd,
    time::{Duration, Instant},
};

use anyhow::Result;
use nix::sys::{
    epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
    signal::{SigSet, Signal},
    signalfd::{SfdFlags, SignalFd},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Io {
        token: u64,
        readable: bool,
        writable: bool,
        hup: bool,
    },
    Timer {
        token: u64,
    },
}

pub struct Poller {
    epoll: Epoll,
    deadlines: BTreeSet<(Instant, u64)>,
    by_token: HashMap<u64, Instant>,
}

impl Poller {
    pub fn new() -> Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            deadlines: BTreeSet::new(),
            by_token: HashMap::new(),
        })
    }

    fn interest(read: bool, write: bool) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if read {
            flags |= EpollFlags::EPOLLIN;
        }
        if write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    pub fn add<F: AsFd>(&self, fd: &F, token: u64, read: bool, write: bool) -> Result<()> {
        self.epoll
            .add(fd, EpollEvent::new(Self::interest(read, write), token))?;
        Ok(())
    }

    pub fn modify<F: AsFd>(&self, fd: &F, token: u64, read: bool, write: bool) -> Result<()> {
        let mut ev = EpollEvent::new(Self::interest(read, write), token);
        self.epoll.modify(fd, &mut ev)?;
        Ok(())
    }

    pub fn delete<F: AsFd>(&self, fd: &F) -> Result<()> {
        self.epoll.delete(fd)?;
        Ok(())
    }

    /// Arm (or re-arm) the deadline for a timer token.
    pub fn arm_at(&mut self, token: u64, at: Instant) {
        if let Some(prev) = self.by_token.insert(token, at) {
            self.deadlines.remove(&(prev, token));
        }
        self.deadlines.insert((at, token));
    }

    pub fn arm_in(&mut self, token: u64, after: Duration) {
        self.arm_at(token, Instant::now() + after);
    }

    pub fn disarm(&mut self, token: u64) {
        if let Some(prev) = self.by_token.remove(&token) {
            self.deadlines.remove(&(prev, token));
        }
    }

    pub fn deadline(&self, token: u64) -> Option<Instant> {
        self.by_token.get(&token).copied()
    }

    /// Block until I/O readiness or the next deadline, appending events.
    pub fn wait(&mut self, out: &mut Vec<Event>) -> Result<()> {
        out.clear();
        let now = Instant::now();
        let timeout = match self.deadlines.first() {
            Some(&(at, _)) => {
                let ms = at.saturating_duration_since(now).as_millis();
                // Clamp long sleeps; an early wakeup just re-waits.
                EpollTimeout::from(ms.min(60_000) as u16 + u16::from(ms > 0))
            }
            None => EpollTimeout::NONE,
        };

        let mut events = [EpollEvent::empty(); 64];
        let n = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        for ev in &events[..n] {
            let flags = ev.events();
            out.push(Event::Io {
                token: ev.data(),
                readable: flags.contains(EpollFlags::EPOLLIN),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                hup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR),
            });
        }

        let now = Instant::now();
        while let Some(&(at, token)) = self.deadlines.first() {
            if at > now {
                break;
            }
            self.deadlines.pop_first();
            self.by_token.remove(&token);
            out.push(Event::Timer { token });
        }
        Ok(())
    }
}

/// Block the given signals for the thread and return a non-blocking
/// signalfd delivering them; register it with the poller like any fd.
pub fn signal_fd(signals: &[Signal]) -> Result<SignalFd> {
    let mut mask = SigSet::empty();
    for sig in signals {
        mask.add(*sig);
    }
    mask.thread_block()?;
    let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
    Ok(sfd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Channel;
    use crate::ipc::MsgType;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut poller = Poller::new().unwrap();
        let now = Instant::now();
        poller.arm_at(2, now + Duration::from_millis(30));
        poller.arm_at(1, now + Duration::from_millis(5));

        let mut events = Vec::new();
        let mut fired = Vec::new();
        while fired.len() < 2 {
            poller.wait(&mut events).unwrap();
            for ev in &events {
                if let Event::Timer { token } = ev {
                    fired.push(*token);
                }
            }
        }
        assert_eq!(fired, vec![1, 2]);
    }

    #[test]
    fn rearm_replaces_deadline() {
        let mut poller = Poller::new().unwrap();
        poller.arm_in(9, Duration::from_secs(60));
        poller.arm_in(9, Duration::from_millis(1));

        let mut events = Vec::new();
        poller.wait(&mut events).unwrap();
        if events.is_empty() {
            poller.wait(&mut events).unwrap();
        }
        assert!(events.contains(&Event::Timer { token: 9 }));
        assert!(poller.deadline(9).is_none());
    }

    #[test]
    fn io_readiness_reported_with_token() {
        let mut poller = Poller::new().unwrap();
        let (mut a, b) = Channel::pair().unwrap();
        poller.add(&b, 77, true, false).unwrap();
        a.send(MsgType::CtlOk, 0, &()).unwrap();

        let mut events = Vec::new();
        poller.wait(&mut events).unwrap();
        match events.as_slice() {
            [Event::Io {
                token: 77,
                readable: true,
                ..
            }] => {}
            other => panic!("unexpected events {other:?}"),
        }
    }
}
