//! Request ids and single-shot reply waiters for one connection.

use std::collections::HashMap;
use std::sync::Mutex;

use remora_wire::{Command, Message};
use tokio::sync::oneshot;

use crate::RpcError;

/// Hands out ids in `1..=ceiling`, wrapping back to 1, skipping any id
/// that is still outstanding.
#[derive(Debug)]
pub struct IdIssuer {
    next: u32,
    ceiling: u32,
}

impl IdIssuer {
    pub fn new(ceiling: u32) -> Self {
        Self { next: 1, ceiling: ceiling.max(1) }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Returns `None` when every id in range is in use.
    pub fn issue(&mut self, in_use: impl Fn(u32) -> bool) -> Option<u32> {
        for _ in 0..self.ceiling {
            let id = self.next;
            self.next = if self.next >= self.ceiling { 1 } else { self.next + 1 };
            if !in_use(id) {
                return Some(id);
            }
        }
        None
    }
}

/// What a reply must look like, beyond carrying the request id and a status.
#[derive(Clone, Debug)]
pub struct Expect {
    command: Option<Command>,
    token: Option<String>,
}

impl Expect {
    /// Open/Close replies: no command header, matched on id alone.
    pub fn reply() -> Self {
        Self { command: None, token: None }
    }

    /// Execute replies: no command header, and the token must echo the call's.
    pub fn reply_for(token: &str) -> Self {
        Self { command: None, token: Some(token.to_string()) }
    }

    /// Remote stream replies.
    pub fn stream(token: &str) -> Self {
        Self { command: Some(Command::Stream), token: Some(token.to_string()) }
    }

    pub fn matches(&self, id: u32, message: &Message) -> bool {
        if message.id() != Some(id) || message.status_raw().is_none() {
            return false;
        }
        let command_ok = match self.command {
            Some(command) => message.command() == Some(command),
            None => message.command_raw().is_none(),
        };
        let token_ok = match &self.token {
            Some(token) => message.token().is_some_and(|tk| tk.eq_ignore_ascii_case(token)),
            None => true,
        };
        command_ok && token_ok
    }
}

struct Waiter {
    expect: Expect,
    tx: oneshot::Sender<Message>,
}

struct Pending {
    issuer: IdIssuer,
    waiters: HashMap<u32, Waiter>,
    closed: bool,
}

/// Pending-call registry. The lock only guards map mutation; waiting happens
/// on the returned receiver.
pub(crate) struct Correlator {
    pending: Mutex<Pending>,
}

impl Correlator {
    pub(crate) fn new(id_ceiling: u32) -> Self {
        Self {
            pending: Mutex::new(Pending {
                issuer: IdIssuer::new(id_ceiling),
                waiters: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(
        &self,
        expect: Expect,
    ) -> Result<(u32, oneshot::Receiver<Message>), RpcError> {
        let mut pending = self.lock();
        if pending.closed {
            return Err(RpcError::channel("connection closed"));
        }
        let Pending { issuer, waiters, .. } = &mut *pending;
        let id = issuer
            .issue(|id| waiters.contains_key(&id))
            .ok_or(RpcError::Busy { ceiling: issuer.ceiling() })?;
        let (tx, rx) = oneshot::channel();
        waiters.insert(id, Waiter { expect, tx });
        Ok((id, rx))
    }

    pub(crate) fn unregister(&self, id: u32) {
        self.lock().waiters.remove(&id);
    }

    /// Hands `message` to the waiter it answers. Returns the message back when
    /// nobody was waiting for it.
    pub(crate) fn complete(&self, message: Message) -> Option<Message> {
        let Some(id) = message.id() else {
            return Some(message);
        };
        let waiter = {
            let mut pending = self.lock();
            let answers = pending.waiters.get(&id).is_some_and(|w| w.expect.matches(id, &message));
            if answers {
                pending.waiters.remove(&id)
            } else {
                None
            }
        };
        match waiter {
            Some(waiter) => {
                if waiter.tx.send(message).is_err() {
                    log::debug!("correlation: waiter for id {id} went away before its reply");
                }
                None
            }
            None => Some(message),
        }
    }

    /// Drops every waiter; their receivers observe the disconnect.
    pub(crate) fn fail_all(&self) {
        let mut pending = self.lock();
        pending.closed = true;
        let dropped = pending.waiters.len();
        pending.waiters.clear();
        if dropped > 0 {
            log::debug!("correlation: aborted {dropped} pending calls");
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_wire::Status;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn reply(id: u32) -> Message {
        Message::new().with_id(id).with_status(Status::Ok)
    }

    #[test]
    fn issuer_wraps_at_the_ceiling() {
        let mut issuer = IdIssuer::new(3);
        let ids: Vec<_> = (0..5).map(|_| issuer.issue(|_| false).expect("id")).collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn issuer_skips_ids_still_in_use_and_reports_exhaustion() {
        let mut issuer = IdIssuer::new(4);
        assert_eq!(issuer.issue(|id| id == 1 || id == 2), Some(3));
        assert_eq!(issuer.issue(|_| true), None);
    }

    #[test]
    fn reply_goes_to_exactly_one_waiter_and_duplicates_are_returned() {
        let correlator = Correlator::new(125);
        let (id, mut rx) = correlator.register(Expect::reply()).expect("register");

        assert!(correlator.complete(reply(id)).is_none());
        assert!(rx.try_recv().is_ok());
        assert!(correlator.complete(reply(id)).is_some());
        assert_eq!(correlator.outstanding(), 0);
    }

    #[test]
    fn execute_replies_must_echo_the_token() {
        let correlator = Correlator::new(125);
        let (id, mut rx) = correlator.register(Expect::reply_for("AbC")).expect("register");

        let stray = reply(id).with_token("other");
        assert!(correlator.complete(stray).is_some());
        assert!(correlator.complete(reply(id).with_token("abc")).is_none());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn requests_without_status_never_complete_a_waiter() {
        let correlator = Correlator::new(125);
        let (id, _rx) = correlator.register(Expect::stream("t")).expect("register");
        let request = Message::for_command(Command::Stream).with_token("t").with_id(id);
        assert!(correlator.complete(request).is_some());
        assert_eq!(correlator.outstanding(), 1);
    }

    #[test]
    fn full_registry_reports_busy() {
        let correlator = Correlator::new(2);
        let _a = correlator.register(Expect::reply()).expect("first");
        let _b = correlator.register(Expect::reply()).expect("second");
        assert_eq!(
            correlator.register(Expect::reply()).err(),
            Some(RpcError::Busy { ceiling: 2 })
        );
    }

    #[test]
    fn fail_all_closes_receivers_and_rejects_new_registrations() {
        let correlator = Correlator::new(125);
        let (_, mut rx) = correlator.register(Expect::reply()).expect("register");
        correlator.fail_all();
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
        assert!(matches!(correlator.register(Expect::reply()), Err(RpcError::ChannelFault { .. })));
    }

    #[test]
    fn concurrent_callers_never_share_an_outstanding_id() {
        let correlator = Arc::new(Correlator::new(125));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let correlator = Arc::clone(&correlator);
                std::thread::spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..12 {
                        let (id, rx) = correlator.register(Expect::reply()).expect("register");
                        held.push((id, rx));
                    }
                    held
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for thread in threads {
            for (id, _rx) in thread.join().expect("thread") {
                assert!((1..=125).contains(&id));
                assert!(seen.insert(id), "id {id} issued twice while outstanding");
            }
        }
        assert_eq!(seen.len(), 96);
    }
}
