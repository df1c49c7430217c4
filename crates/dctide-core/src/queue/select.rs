//! The slot scheduler.
//!
//! A debounced pass that hands free download slots to the best
//! candidates. Preference order: users with an open idle session first
//! (never waste a connection), then users we would have to connect to;
//! within a group, candidates compare by their best queue entry.

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::{debug, info};

use crate::session::{DownloadTask, HubApi, PeerSession};
use crate::user::Uid;

use super::queue::DlQueue;
use super::users::{entry_cmp, UserState};

/// What one selection pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SelectOutcome {
    /// Users a connect was requested for
    pub connects: Vec<Uid>,
    /// Users whose idle session was given a download
    pub started: Vec<Uid>,
}

impl DlQueue {
    /// Run one selection pass.
    ///
    /// `slots` is the configured concurrent-download count; sessions
    /// holds the open peer sessions keyed by user.
    pub fn select_pass(
        &mut self,
        hubs: &mut dyn HubApi,
        sessions: &mut HashMap<Uid, Box<dyn PeerSession>>,
        slots: u32,
    ) -> SelectOutcome {
        let mut outcome = SelectOutcome::default();
        let active = self
            .users
            .values()
            .filter(|u| u.state == UserState::Active)
            .count() as u32;
        let mut free = slots.saturating_sub(active);

        loop {
            if free == 0 {
                break;
            }
            let Some(uid) = self.best_candidate(hubs) else {
                break;
            };
            let state = self.users[&uid].state;
            match state {
                UserState::NotConnected => {
                    debug!(%uid, "requesting peer connection");
                    self.set_state_event(uid, UserState::Expecting);
                    hubs.request_connect(uid);
                    outcome.connects.push(uid);
                }
                UserState::Idle => {
                    let Some(session) = sessions.get_mut(&uid) else {
                        // Session vanished between events; the user is
                        // not really idle.
                        self.user_cc(uid, false);
                        continue;
                    };
                    let Some(task) = self.claim_next(uid) else {
                        continue;
                    };
                    info!(%uid, tth = %task.tth, offset = task.offset, "starting download");
                    session.download(task);
                    outcome.started.push(uid);
                    free -= 1;
                }
                _ => unreachable!("candidates are NotConnected or Idle"),
            }
        }
        outcome
    }

    fn set_state_event(&mut self, uid: Uid, state: UserState) {
        if let Some(user) = self.users.get_mut(&uid) {
            user.state = state;
        }
        self.emit(super::queue::QueueEvent::UserState(uid, state));
    }

    /// Best candidate user, or `None` when no one is eligible.
    fn best_candidate(&self, hubs: &dyn HubApi) -> Option<Uid> {
        let mut best: Option<Uid> = None;
        for (&uid, user) in &self.users {
            let eligible = match user.state {
                UserState::Idle => true,
                UserState::NotConnected => hubs.user_online(uid),
                _ => false,
            };
            if !eligible || !user.has_work(&self.records) {
                continue;
            }
            best = Some(match best {
                None => uid,
                Some(cur) => {
                    if self.candidate_cmp(uid, cur) == Ordering::Less {
                        uid
                    } else {
                        cur
                    }
                }
            });
        }
        best
    }

    /// Less = better.
    fn candidate_cmp(&self, a: Uid, b: Uid) -> Ordering {
        let ua = &self.users[&a];
        let ub = &self.users[&b];
        let rank = |s: UserState| match s {
            UserState::Idle => 0u8,
            _ => 1,
        };
        rank(ua.state).cmp(&rank(ub.state)).then_with(|| {
            match (
                ua.next_download(&self.records),
                ub.next_download(&self.records),
            ) {
                (Some(ea), Some(eb)) => entry_cmp(ea, eb, &self.records),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
    }

    /// Claim the next entry of an idle user: flag the record active and
    /// move the user to `Active`.
    fn claim_next(&mut self, uid: Uid) -> Option<DownloadTask> {
        let user = self.users.get(&uid)?;
        let entry_tth = user.next_download(&self.records)?.tth;
        let min_tthl = self.cfg.min_tthl_size;
        let rec = self.records.get_mut(&entry_tth)?;
        rec.active = true;
        let task = DownloadTask {
            tth: rec.tth,
            is_list: rec.is_list,
            offset: rec.have,
            size: rec.size,
            need_tthl: !rec.is_list && !rec.has_tthl && rec.size >= min_tthl,
        };
        let user = self.users.get_mut(&uid).expect("checked above");
        user.active = Some(entry_tth);
        self.set_state_event(uid, UserState::Active);
        Some(task)
    }
}
