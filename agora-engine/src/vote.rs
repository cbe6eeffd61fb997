use std::time::Duration;

use anyhow::Context;

use crate::{
    api::{Actor, CastVote, Db, SetDeleted, UserId, Votable, VotableId, Vote, VoteResult},
    cast_vote, AggregateCounter, Error, KarmaQueue,
};

/// Longest pause after the first lost race, doubled on each further loss
const RETRY_PAUSE_BASE: Duration = Duration::from_micros(200);
const RETRY_PAUSE_MAX: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug)]
pub struct VotePolicy {
    /// Whether authors may vote on their own content
    pub allow_self_votes: bool,
}

impl Default for VotePolicy {
    fn default() -> VotePolicy {
        VotePolicy {
            allow_self_votes: true,
        }
    }
}

/// Random pause in `0..min(base * 2^(lost - 1), max)`, so that writers that
/// collided do not collide again right away
fn retry_pause(lost: u32) -> Duration {
    let ceiling = RETRY_PAUSE_BASE
        .saturating_mul(2u32.saturating_pow(lost.saturating_sub(1)))
        .min(RETRY_PAUSE_MAX);
    ceiling.mul_f64(rand::random::<f64>())
}

/// Load, mutate, recompute and store a votable as one unit
///
/// A store that lost the race against a concurrent writer is retried on the
/// fresh state until it lands. Every lost race means another writer landed, so
/// this always makes progress. Only storage failures are reported.
///
/// `f` returns whether it changed anything; nothing is stored if not.
async fn mutate_votable<D, F>(db: &mut D, id: VotableId, mut f: F) -> Result<(Votable, bool), Error>
where
    D: Db,
    F: Send + FnMut(&mut Votable) -> Result<bool, Error>,
{
    let mut lost = 0;
    loop {
        let mut v = db
            .load_votable(id)
            .await
            .with_context(|| format!("loading votable {:?}", id))?
            .ok_or_else(|| Error::not_found(id.uuid()))?;
        if !f(&mut v)? {
            return Ok((v, false));
        }
        v.recompute();
        let expected_revision = v.revision;
        v.revision += 1;
        match db.store_votable(&v, expected_revision).await {
            Ok(true) => return Ok((v, true)),
            Ok(false) => {
                lost += 1;
                tracing::debug!(?id, lost, "concurrent update of votable, retrying");
                tokio::time::sleep(retry_pause(lost)).await;
            }
            Err(err) => {
                tracing::error!(?err, ?id, "failed storing votable");
                return Err(Error::aggregation_failure(id.uuid()));
            }
        }
    }
}

/// Casts or retracts the vote of `voter`
///
/// The vote set and the recomputed score are stored together or not at all.
/// The karma of the author is then recomputed in the background if the score
/// moved.
pub async fn submit_vote<D: Db>(
    db: &mut D,
    karma: &KarmaQueue,
    policy: VotePolicy,
    voter: UserId,
    req: &CastVote,
) -> Result<VoteResult, Error> {
    let vote = Vote::from_value(req.value)?;
    let (v, changed) = mutate_votable(db, req.votable, |v| {
        if !policy.allow_self_votes && vote.is_some() && v.author == voter {
            return Err(Error::permission_denied());
        }
        let change = cast_vote(v, voter, req.value)?;
        Ok(!change.is_noop())
    })
    .await?;
    if changed {
        tracing::debug!(votable = ?req.votable, ?voter, value = req.value, score = v.score, "vote recorded");
        karma.trigger(v.author);
    }
    Ok(VoteResult {
        score: v.score,
        voter_value: Vote::value_of(vote),
    })
}

/// Soft-deletes or restores a votable, which the author or an admin may do
///
/// Votes are kept either way, but a deleted votable stops counting towards its
/// author's karma.
pub async fn set_deleted<D: Db>(
    db: &mut D,
    karma: &KarmaQueue,
    actor: Actor,
    req: &SetDeleted,
) -> Result<(), Error> {
    let (v, changed) = mutate_votable(db, req.votable, |v| {
        if !actor.can_moderate(v.author) {
            return Err(Error::permission_denied());
        }
        if v.deleted == req.deleted {
            return Ok(false);
        }
        v.deleted = req.deleted;
        Ok(true)
    })
    .await?;
    if changed {
        tracing::info!(votable = ?req.votable, actor = ?actor.user, deleted = req.deleted, "votable deletion flag changed");
        karma.trigger(v.author);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use futures::future::join_all;

    use super::*;
    use crate::{
        api::{Error as ApiError, PostId, Uuid},
        KarmaConfig, MemDb,
    };

    async fn setup() -> (MemDb, KarmaQueue, UserId, PostId) {
        let db = MemDb::new();
        let (karma, _) = KarmaQueue::spawn(db.clone(), KarmaConfig::default());
        let author = db.add_user(false).await;
        let post = db.add_post(author).await;
        (db, karma, author, post)
    }

    fn vote(post: PostId, value: i64) -> CastVote {
        CastVote {
            votable: VotableId::Post(post),
            value,
        }
    }

    #[tokio::test]
    async fn vote_updates_score_and_karma() {
        let (mut db, karma, author, post) = setup().await;
        let voter = db.add_user(false).await;
        let policy = VotePolicy::default();

        let res = submit_vote(&mut db, &karma, policy, voter, &vote(post, 1)).await.unwrap();
        assert_eq!(res, VoteResult { score: 1, voter_value: 1 });
        karma.flush().await.unwrap();
        assert_eq!(db.karma_of(author).await, Some(1));

        let res = submit_vote(&mut db, &karma, policy, voter, &vote(post, -1)).await.unwrap();
        assert_eq!(res, VoteResult { score: -1, voter_value: -1 });

        let res = submit_vote(&mut db, &karma, policy, voter, &vote(post, 0)).await.unwrap();
        assert_eq!(res, VoteResult { score: 0, voter_value: 0 });
        karma.flush().await.unwrap();
        assert_eq!(db.karma_of(author).await, Some(0));
        // karma goes to the author, not the voter
        assert_eq!(db.karma_of(voter).await, Some(0));
    }

    #[tokio::test]
    async fn repeated_vote_does_not_write() {
        let (mut db, karma, _, post) = setup().await;
        let voter = db.add_user(false).await;
        let policy = VotePolicy::default();
        submit_vote(&mut db, &karma, policy, voter, &vote(post, 1)).await.unwrap();
        let before = db.load_votable(VotableId::Post(post)).await.unwrap().unwrap();

        let res = submit_vote(&mut db, &karma, policy, voter, &vote(post, 1)).await.unwrap();
        assert_eq!(res, VoteResult { score: 1, voter_value: 1 });
        let after = db.load_votable(VotableId::Post(post)).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn rejected_votes() {
        let (mut db, karma, author, post) = setup().await;
        let voter = db.add_user(false).await;
        let policy = VotePolicy::default();

        let err = submit_vote(&mut db, &karma, policy, voter, &vote(post, 5)).await.unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::InvalidValue(5)));

        let ghost = PostId(Uuid::new_v4());
        let err = submit_vote(&mut db, &karma, policy, voter, &vote(ghost, 1)).await.unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::NotFound(ghost.0)));

        let strict = VotePolicy {
            allow_self_votes: false,
        };
        let err = submit_vote(&mut db, &karma, strict, author, &vote(post, 1)).await.unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::PermissionDenied));
        // self-votes are fine with the default policy
        submit_vote(&mut db, &karma, policy, author, &vote(post, 1)).await.unwrap();
        // and can always be retracted
        let res = submit_vote(&mut db, &karma, strict, author, &vote(post, 0)).await.unwrap();
        assert_eq!(res.score, 0);
    }

    #[tokio::test]
    async fn failed_store_rejects_the_vote() {
        let (mut db, karma, _, post) = setup().await;
        let voter = db.add_user(false).await;
        db.fail_next_votable_writes(1).await;
        let err = submit_vote(&mut db, &karma, VotePolicy::default(), voter, &vote(post, 1))
            .await
            .unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::AggregationFailure(post.0)));
        let v = db.load_votable(VotableId::Post(post)).await.unwrap().unwrap();
        assert!(v.votes.is_empty());
        assert_eq!(v.score, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_votes_are_not_lost() {
        let (db, karma, author, post) = setup().await;
        let mut voters = Vec::new();
        for _ in 0..200 {
            voters.push(db.add_user(false).await);
        }
        let results = join_all(voters.iter().enumerate().map(|(i, voter)| {
            let mut db = db.clone();
            let karma = karma.clone();
            let voter = *voter;
            tokio::spawn(async move {
                let value = if i % 3 == 0 { -1 } else { 1 };
                submit_vote(&mut db, &karma, VotePolicy::default(), voter, &vote(post, value))
                    .await
                    .map(|_| value)
            })
        }))
        .await;
        let mut expected = 0;
        for r in results {
            expected += r.expect("vote task panicked").expect("vote was rejected");
        }

        let mut db = db;
        let v = db.load_votable(VotableId::Post(post)).await.unwrap().unwrap();
        assert_eq!(v.votes.len(), voters.len());
        assert_eq!(v.score, expected);
        assert_eq!(v.revision, voters.len() as i64);
        assert!(v.score_is_consistent());
        karma.flush().await.unwrap();
        assert_eq!(db.karma_of(author).await, Some(expected));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_flips_by_one_voter_settle_on_a_consistent_score() {
        let (db, karma, _, post) = setup().await;
        let voter = db.add_user(false).await;
        let others = [db.add_user(false).await, db.add_user(false).await];
        let tasks = (0..100).map(|i| {
            let mut db = db.clone();
            let karma = karma.clone();
            let who = if i % 2 == 0 { voter } else { others[i % 4 / 2] };
            tokio::spawn(async move {
                let value = [1, 0, -1][i % 3];
                submit_vote(&mut db, &karma, VotePolicy::default(), who, &vote(post, value)).await
            })
        });
        for r in join_all(tasks).await {
            r.expect("vote task panicked").expect("vote was rejected");
        }
        let mut db = db;
        let v = db.load_votable(VotableId::Post(post)).await.unwrap().unwrap();
        assert!(v.votes.len() <= 3);
        assert!(v.score_is_consistent());
    }

    #[tokio::test]
    async fn deletion_rules() {
        let (mut db, karma, author, post) = setup().await;
        let stranger = db.add_user(false).await;
        let admin = db.add_user(true).await;
        let id = VotableId::Post(post);
        submit_vote(&mut db, &karma, VotePolicy::default(), stranger, &vote(post, 1)).await.unwrap();

        let actor = |user, is_admin| Actor { user, is_admin };
        let del = |deleted| SetDeleted { votable: id, deleted };

        let err = set_deleted(&mut db, &karma, actor(stranger, false), &del(true)).await.unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::PermissionDenied));

        set_deleted(&mut db, &karma, actor(author, false), &del(true)).await.unwrap();
        karma.flush().await.unwrap();
        assert_eq!(db.karma_of(author).await, Some(0));

        // frozen: votes are kept but no new vote is accepted
        let err = submit_vote(&mut db, &karma, VotePolicy::default(), admin, &vote(post, 1))
            .await
            .unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::NotFound(post.0)));
        let v = db.load_votable(id).await.unwrap().unwrap();
        assert_eq!(v.votes.iter().map(|(u, _)| *u).collect::<HashSet<_>>(), HashSet::from([stranger]));

        set_deleted(&mut db, &karma, actor(admin, true), &del(false)).await.unwrap();
        karma.flush().await.unwrap();
        assert_eq!(db.karma_of(author).await, Some(1));
    }
}
