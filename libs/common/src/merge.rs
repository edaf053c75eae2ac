//! State merge engine.
//!
//! Runs once per inbound snapshot. The remote document wins for every field
//! except the handful the local user is actively editing:
//!
//! 1. focused free text (ticket text, group title, action text, open answer)
//! 2. the user's own single-choice picks (mood, ratings)
//! 3. the user's own entries in per-ticket / per-group vote lists, unless the
//!    vote cap changed, in which case the remote (pruned) lists are trusted
//! 4. structural membership (ticket → group, column) always comes from remote
//!
//! Two users editing the same field at the same instant lose one edit. That
//! is the accepted limit of whole-document broadcast.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::document::{SessionDocument, SnapshotError};

/// Something the local user can be in the middle of editing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EditTarget {
    TicketText(String),
    GroupTitle(String),
    ActionText(String),
    OpenAnswer,
    Mood,
    Ratings,
    /// A vote click whose debounce has not fired yet.
    Votes,
}

/// "I am actively editing this" flags, maintained by the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalEdits {
    pub tickets: HashSet<String>,
    pub groups: HashSet<String>,
    pub actions: HashSet<String>,
    pub open_answer: bool,
    pub mood: bool,
    pub ratings: bool,
    pub votes: bool,
}

impl LocalEdits {
    pub fn set(&mut self, target: EditTarget, active: bool) {
        fn toggle(set: &mut HashSet<String>, id: String, active: bool) {
            if active {
                set.insert(id);
            } else {
                set.remove(&id);
            }
        }

        match target {
            EditTarget::TicketText(id) => toggle(&mut self.tickets, id, active),
            EditTarget::GroupTitle(id) => toggle(&mut self.groups, id, active),
            EditTarget::ActionText(id) => toggle(&mut self.actions, id, active),
            EditTarget::OpenAnswer => self.open_answer = active,
            EditTarget::Mood => self.mood = active,
            EditTarget::Ratings => self.ratings = active,
            EditTarget::Votes => self.votes = active,
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Merge a freshly received snapshot into the locally held one.
pub fn merge_snapshots(
    remote: &SessionDocument,
    local: &SessionDocument,
    user_id: &str,
    edits: &LocalEdits,
) -> SessionDocument {
    let mut merged = remote.clone();
    if remote.id != local.id || edits.is_idle() {
        return merged;
    }

    keep_focused_text(&mut merged, local, user_id, edits);
    keep_own_choices(&mut merged, local, user_id, edits);
    if edits.votes {
        keep_own_votes(&mut merged, local, user_id);
    }

    merged
}

/// Validate a raw snapshot, then merge it with `local` if there is one.
///
/// On error the caller is expected to keep its local copy untouched.
pub fn merge_incoming(
    remote: Value,
    local: Option<&SessionDocument>,
    user_id: &str,
    edits: &LocalEdits,
) -> Result<SessionDocument, SnapshotError> {
    let remote = SessionDocument::from_snapshot(remote)?;
    Ok(match local {
        Some(local) => merge_snapshots(&remote, local, user_id, edits),
        None => remote,
    })
}

fn keep_focused_text(
    merged: &mut SessionDocument,
    local: &SessionDocument,
    user_id: &str,
    edits: &LocalEdits,
) {
    for ticket in merged.tickets.iter_mut().filter(|t| edits.tickets.contains(&t.id)) {
        if let Some(mine) = local.ticket(&ticket.id) {
            ticket.text.clone_from(&mine.text);
        }
    }
    for group in merged.groups.iter_mut().filter(|g| edits.groups.contains(&g.id)) {
        if let Some(mine) = local.group(&group.id) {
            group.title.clone_from(&mine.title);
        }
    }
    for action in merged.actions.iter_mut().filter(|a| edits.actions.contains(&a.id)) {
        if let Some(mine) = local.action(&action.id) {
            action.text.clone_from(&mine.text);
        }
    }
    if edits.open_answer {
        keep_own_entry(&mut merged.open_answers, &local.open_answers, user_id);
    }
}

fn keep_own_choices(
    merged: &mut SessionDocument,
    local: &SessionDocument,
    user_id: &str,
    edits: &LocalEdits,
) {
    if edits.mood {
        keep_own_entry(&mut merged.mood, &local.mood, user_id);
    }
    if edits.ratings {
        for (dimension, scores) in &local.ratings {
            if let Some(score) = scores.get(user_id) {
                merged
                    .ratings
                    .entry(dimension.clone())
                    .or_default()
                    .insert(user_id.to_string(), *score);
            }
        }
        for (dimension, scores) in merged.ratings.iter_mut() {
            let rated_locally = local
                .ratings
                .get(dimension)
                .is_some_and(|s| s.contains_key(user_id));
            if !rated_locally {
                scores.remove(user_id);
            }
        }
    }
}

fn keep_own_votes(merged: &mut SessionDocument, local: &SessionDocument, user_id: &str) {
    if merged.settings.max_votes != local.settings.max_votes {
        // The facilitator just pruned votes to the new cap; restoring ours
        // would undo that.
        tracing::debug!(
            session_id = %merged.id,
            from = local.settings.max_votes,
            to = merged.settings.max_votes,
            "vote cap changed, adopting remote vote lists"
        );
    } else {
        for ticket in merged.tickets.iter_mut() {
            if let Some(mine) = local.ticket(&ticket.id) {
                rebase_votes(&mut ticket.votes, &mine.votes, user_id);
            }
        }
        for group in merged.groups.iter_mut() {
            if let Some(mine) = local.group(&group.id) {
                rebase_votes(&mut group.votes, &mine.votes, user_id);
            }
        }
    }

    for action in merged.actions.iter_mut() {
        if let Some(mine) = local.action(&action.id) {
            keep_own_entry(&mut action.proposal_votes, &mine.proposal_votes, user_id);
        }
    }
}

/// Replace `user_id`'s entries in `remote` with those from `local`.
/// Leaves `remote` untouched when the counts already agree.
fn rebase_votes(remote: &mut Vec<String>, local: &[String], user_id: &str) {
    let own = local.iter().filter(|v| *v == user_id).count();
    if remote.iter().filter(|v| *v == user_id).count() == own {
        return;
    }
    remote.retain(|v| v != user_id);
    remote.extend(std::iter::repeat(user_id.to_string()).take(own));
}

fn keep_own_entry<V: Clone>(
    merged: &mut BTreeMap<String, V>,
    local: &BTreeMap<String, V>,
    user_id: &str,
) {
    match local.get(user_id) {
        Some(value) => {
            merged.insert(user_id.to_string(), value.clone());
        }
        None => {
            merged.remove(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{
        ActionItem, Group, Phase, ProposalVote, SessionKind, Ticket,
    };

    const ME: &str = "u1";

    fn board() -> SessionDocument {
        let mut doc = SessionDocument::new("S1", "team-1", SessionKind::Retrospective);
        doc.phase = Phase::Vote;
        doc.tickets = vec![
            Ticket {
                id: "t1".into(),
                column_id: "went-well".into(),
                text: "Pairing".into(),
                author_id: ME.into(),
                group_id: None,
                votes: vec![ME.into(), "u2".into()],
            },
            Ticket {
                id: "t2".into(),
                column_id: "to-improve".into(),
                text: "Flaky CI".into(),
                author_id: "u2".into(),
                group_id: Some("g1".into()),
                votes: vec![],
            },
        ];
        doc.groups = vec![Group {
            id: "g1".into(),
            column_id: "to-improve".into(),
            title: "Tooling".into(),
            votes: vec!["u2".into()],
        }];
        doc.actions = vec![ActionItem::proposal("a1", "Fix CI")];
        doc
    }

    fn all_flags() -> LocalEdits {
        let mut edits = LocalEdits::default();
        edits.set(EditTarget::TicketText("t1".into()), true);
        edits.set(EditTarget::GroupTitle("g1".into()), true);
        edits.set(EditTarget::ActionText("a1".into()), true);
        edits.set(EditTarget::OpenAnswer, true);
        edits.set(EditTarget::Mood, true);
        edits.set(EditTarget::Ratings, true);
        edits.set(EditTarget::Votes, true);
        edits
    }

    #[test]
    fn merging_a_snapshot_with_itself_is_identity() {
        let mut doc = board();
        doc.mood.insert(ME.into(), "sunny".into());
        doc.open_answers.insert(ME.into(), "More demos".into());
        doc.ratings
            .entry("speed".into())
            .or_default()
            .insert(ME.into(), 4);

        assert_eq!(merge_snapshots(&doc, &doc, ME, &LocalEdits::default()), doc);
        assert_eq!(merge_snapshots(&doc, &doc, ME, &all_flags()), doc);
    }

    #[test]
    fn no_flags_means_remote_wins_everywhere() {
        let local = board();
        let mut remote = board();
        remote.tickets[0].text = "Pairing sessions".into();
        remote.tickets[0].votes = vec!["u2".into()];
        remote.phase = Phase::Discuss;

        let merged = merge_snapshots(&remote, &local, ME, &LocalEdits::default());
        assert_eq!(merged, remote);
    }

    #[test]
    fn focused_ticket_text_is_kept_and_everything_else_adopted() {
        let mut local = board();
        local.tickets[0].text = "Pairing on the hard bugs".into();

        let mut remote = board();
        remote.tickets[0].text = "Pairing".into();
        remote.tickets[0].column_id = "to-improve".into();
        remote.tickets[1].text = "Flaky CI on main".into();
        remote.phase = Phase::Discuss;
        remote.settings.reveal_votes = true;

        let mut edits = LocalEdits::default();
        edits.set(EditTarget::TicketText("t1".into()), true);

        let merged = merge_snapshots(&remote, &local, ME, &edits);
        assert_eq!(merged.tickets[0].text, "Pairing on the hard bugs");

        let mut expected = remote.clone();
        expected.tickets[0].text = "Pairing on the hard bugs".into();
        assert_eq!(merged, expected);
    }

    #[test]
    fn focused_group_title_and_action_text_are_kept() {
        let mut local = board();
        local.groups[0].title = "Tooling & CI".into();
        local.actions[0].text = "Fix CI by Friday".into();

        let mut remote = board();
        remote.groups[0].title = "Tools".into();
        remote.actions[0].text = "Fix CI".into();
        remote.actions[0].assignee = Some("u2".into());

        let mut edits = LocalEdits::default();
        edits.set(EditTarget::GroupTitle("g1".into()), true);
        edits.set(EditTarget::ActionText("a1".into()), true);

        let merged = merge_snapshots(&remote, &local, ME, &edits);
        assert_eq!(merged.groups[0].title, "Tooling & CI");
        assert_eq!(merged.actions[0].text, "Fix CI by Friday");
        assert_eq!(merged.actions[0].assignee.as_deref(), Some("u2"));
    }

    #[test]
    fn group_membership_always_comes_from_remote() {
        let mut local = board();
        local.tickets[1].group_id = None;

        let remote = board();

        let mut edits = all_flags();
        edits.set(EditTarget::TicketText("t2".into()), true);

        let merged = merge_snapshots(&remote, &local, ME, &edits);
        assert_eq!(merged.tickets[1].group_id.as_deref(), Some("g1"));
    }

    #[test]
    fn own_votes_are_rebased_onto_remote_list() {
        let mut local = board();
        local.tickets[0].votes = vec![ME.into(), ME.into(), "u2".into()];
        local.groups[0].votes = vec!["u2".into(), ME.into()];

        let mut remote = board();
        remote.tickets[0].votes = vec![ME.into(), "u2".into(), "u3".into()];
        remote.groups[0].votes = vec!["u2".into(), "u3".into()];

        let mut edits = LocalEdits::default();
        edits.set(EditTarget::Votes, true);

        let merged = merge_snapshots(&remote, &local, ME, &edits);
        assert_eq!(merged.tickets[0].votes, vec!["u2", "u3", ME, ME]);
        assert_eq!(merged.groups[0].votes, vec!["u2", "u3", ME]);
    }

    #[test]
    fn vote_cap_change_trusts_pruned_remote_votes() {
        let mut local = board();
        local.settings.max_votes = 5;
        local.tickets[0].votes = vec![ME.into(), ME.into(), ME.into(), ME.into(), "u2".into()];

        let mut remote = board();
        remote.settings.max_votes = 2;
        remote.tickets[0].votes = vec![ME.into(), ME.into(), "u2".into()];

        let mut edits = LocalEdits::default();
        edits.set(EditTarget::Votes, true);

        let merged = merge_snapshots(&remote, &local, ME, &edits);
        assert_eq!(merged.settings.max_votes, 2);
        assert_eq!(merged.tickets[0].votes, vec![ME, ME, "u2"]);
    }

    #[test]
    fn own_mood_ratings_and_answer_are_kept() {
        let mut local = board();
        local.mood.insert(ME.into(), "stormy".into());
        local.open_answers.insert(ME.into(), "Fewer meetings".into());
        local.ratings.entry("fun".into()).or_default().insert(ME.into(), 2);

        let mut remote = board();
        remote.mood.insert(ME.into(), "sunny".into());
        remote.mood.insert("u2".into(), "cloudy".into());
        remote.open_answers.insert("u2".into(), "More pairing".into());
        remote.ratings.entry("speed".into()).or_default().insert(ME.into(), 5);
        remote.ratings.entry("speed".into()).or_default().insert("u2".into(), 3);

        let mut edits = LocalEdits::default();
        edits.set(EditTarget::Mood, true);
        edits.set(EditTarget::Ratings, true);
        edits.set(EditTarget::OpenAnswer, true);

        let merged = merge_snapshots(&remote, &local, ME, &edits);
        assert_eq!(merged.mood[ME], "stormy");
        assert_eq!(merged.mood["u2"], "cloudy");
        assert_eq!(merged.open_answers[ME], "Fewer meetings");
        assert_eq!(merged.open_answers["u2"], "More pairing");
        assert_eq!(merged.ratings["fun"][ME], 2);
        assert!(!merged.ratings["speed"].contains_key(ME));
        assert_eq!(merged.ratings["speed"]["u2"], 3);
    }

    #[test]
    fn own_proposal_vote_is_kept_while_voting() {
        let mut local = board();
        local.actions[0].proposal_votes.insert(ME.into(), ProposalVote::Up);

        let mut remote = board();
        remote.actions[0].proposal_votes.insert("u2".into(), ProposalVote::Down);

        let mut edits = LocalEdits::default();
        edits.set(EditTarget::Votes, true);

        let merged = merge_snapshots(&remote, &local, ME, &edits);
        assert_eq!(merged.actions[0].proposal_votes[ME], ProposalVote::Up);
        assert_eq!(merged.actions[0].proposal_votes["u2"], ProposalVote::Down);
    }

    #[test]
    fn different_session_is_adopted_wholesale() {
        let local = board();
        let mut remote = board();
        remote.id = "S2".into();
        remote.tickets[0].text = "Other".into();

        let merged = merge_snapshots(&remote, &local, ME, &all_flags());
        assert_eq!(merged, remote);
    }

    #[test]
    fn merge_incoming_rejects_malformed_snapshot() {
        let local = board();
        let result = merge_incoming(
            serde_json::json!({ "id": "S1", "tickets": "nope" }),
            Some(&local),
            ME,
            &LocalEdits::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn merge_incoming_without_local_adopts_remote() {
        let remote = board();
        let merged = merge_incoming(
            remote.to_snapshot().unwrap(),
            None,
            ME,
            &all_flags(),
        )
        .unwrap();
        assert_eq!(merged, remote);
    }

    #[test]
    fn clearing_flags_returns_to_idle() {
        let mut edits = all_flags();
        assert!(!edits.is_idle());
        for target in [
            EditTarget::TicketText("t1".into()),
            EditTarget::GroupTitle("g1".into()),
            EditTarget::ActionText("a1".into()),
            EditTarget::OpenAnswer,
            EditTarget::Mood,
            EditTarget::Ratings,
            EditTarget::Votes,
        ] {
            edits.set(target, false);
        }
        assert!(edits.is_idle());
    }
}
