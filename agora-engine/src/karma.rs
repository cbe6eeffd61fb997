use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use anyhow::Context;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    api::{Db, DbPool, Error as ApiError, UserId},
    Error,
};

/// Recomputes the karma of `user` from scratch and stores it
///
/// Karma is the sum of the scores of all the non-deleted posts and comments
/// authored by `user`. Running this twice without intervening votes yields the
/// same value.
pub async fn recompute_karma<D: Db>(db: &mut D, user: UserId) -> Result<i64, Error> {
    let authored = db
        .load_authored(user)
        .await
        .with_context(|| format!("loading content authored by {:?}", user))?;
    let karma = authored
        .iter()
        .filter(|a| !a.deleted)
        .map(|a| a.score)
        .sum::<i64>();
    match db.store_karma(user, karma).await {
        Ok(true) => {
            tracing::debug!(?user, karma, "recomputed karma");
            Ok(karma)
        }
        Ok(false) => Err(Error::not_found(user.0)),
        Err(err) => {
            tracing::error!(?err, ?user, karma, "failed storing karma");
            Err(Error::aggregation_failure(user.0))
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct KarmaConfig {
    /// Delay before the first retry of a failed recompute, doubled on each failure
    pub retry_base: Duration,
    pub retry_max: Duration,

    /// How long recomputes that keep failing are still retried once every
    /// queue is dropped, before being given up on
    pub shutdown_grace: Duration,
}

impl Default for KarmaConfig {
    fn default() -> KarmaConfig {
        KarmaConfig {
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum KarmaMsg {
    Recompute(UserId),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background karma worker
///
/// Triggers are coalesced per user and retried until they succeed, so every
/// trigger leads to at least one successful recompute happening after it.
#[derive(Clone, Debug)]
pub struct KarmaQueue(mpsc::UnboundedSender<KarmaMsg>);

impl KarmaQueue {
    /// Spawns the worker on the current tokio runtime. It stops once all the
    /// queues are dropped and all the pending recomputes are done.
    pub fn spawn<P: DbPool>(pool: P, config: KarmaConfig) -> (KarmaQueue, JoinHandle<()>) {
        // Note: unbounded, so that submitting a vote never waits on karma
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = KarmaWorker {
            pool,
            config,
            failed: BTreeMap::new(),
        };
        (KarmaQueue(sender), tokio::spawn(worker.run(receiver)))
    }

    pub fn trigger(&self, user: UserId) {
        if self.0.send(KarmaMsg::Recompute(user)).is_err() {
            tracing::error!(?user, "karma worker is gone, karma will not be recomputed");
        }
    }

    /// Waits until every trigger sent before this call was attempted at least once
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.0
            .send(KarmaMsg::Flush(sender))
            .map_err(|_| anyhow::anyhow!("karma worker is gone"))?;
        receiver.await.context("karma worker dropped flush request")
    }
}

struct KarmaWorker<P> {
    pool: P,
    config: KarmaConfig,

    /// Users whose last recompute failed, with the number of consecutive failures
    failed: BTreeMap<UserId, u32>,
}

impl<P: DbPool> KarmaWorker<P> {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<KarmaMsg>) {
        tracing::debug!("karma worker started");
        let mut open = true;
        // Next retry of the failed users, kept across incoming triggers
        let mut retry_at: Option<Instant> = None;
        let mut give_up_at: Option<Instant> = None;
        loop {
            let mut batch = BTreeSet::new();
            let mut flushes = Vec::new();
            let mut take = |msg: KarmaMsg| match msg {
                KarmaMsg::Recompute(u) => {
                    batch.insert(u);
                }
                KarmaMsg::Flush(f) => flushes.push(f),
            };

            match (open, retry_at) {
                (true, None) => match receiver.recv().await {
                    None => open = false,
                    Some(msg) => take(msg),
                },
                (true, Some(at)) => tokio::select! {
                    msg = receiver.recv() => match msg {
                        None => open = false,
                        Some(msg) => take(msg),
                    },
                    () = tokio::time::sleep_until(at) => (),
                },
                (false, None) => break,
                (false, Some(at)) => {
                    let wake = give_up_at.map_or(at, |g| g.min(at));
                    tokio::time::sleep_until(wake).await;
                }
            }
            while open {
                match receiver.try_recv() {
                    Ok(msg) => take(msg),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => open = false,
                }
            }
            if !open && give_up_at.is_none() {
                give_up_at = Some(Instant::now() + self.config.shutdown_grace);
            }

            let retry_due = retry_at.map_or(false, |at| at <= Instant::now());
            if retry_due {
                batch.extend(self.failed.keys().copied());
            }
            for user in batch {
                self.recompute(user).await;
            }
            for f in flushes {
                let _ = f.send(());
            }

            if self.failed.is_empty() {
                retry_at = None;
            } else if retry_at.is_none() || retry_due {
                retry_at = Some(Instant::now() + self.backoff());
            }
            if give_up_at.map_or(false, |g| g <= Instant::now()) && !self.failed.is_empty() {
                for (user, failures) in std::mem::take(&mut self.failed) {
                    tracing::error!(?user, failures, "giving up on karma recompute at shutdown");
                }
                retry_at = None;
            }
        }
        tracing::debug!("karma worker stopped");
    }

    fn backoff(&self) -> Duration {
        let failures = self.failed.values().copied().min().unwrap_or(1);
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.config
            .retry_base
            .saturating_mul(factor)
            .min(self.config.retry_max)
    }

    async fn recompute(&mut self, user: UserId) {
        let res = match self.pool.acquire().await {
            Ok(mut conn) => recompute_karma(&mut conn, user).await,
            Err(err) => Err(Error::Anyhow(err)),
        };
        match res {
            Ok(_) => {
                self.failed.remove(&user);
            }
            Err(Error::Api(ApiError::NotFound(_))) => {
                tracing::warn!(?user, "dropping karma recompute for unknown user");
                self.failed.remove(&user);
            }
            Err(err) => {
                let failures = self.failed.entry(user).or_insert(0);
                *failures += 1;
                tracing::warn!(?err, ?user, failures = *failures, "karma recompute failed, will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{Uuid, VotableId},
        MemDb,
    };

    fn fast() -> KarmaConfig {
        KarmaConfig {
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn karma_sums_non_deleted_content() {
        let mut db = MemDb::new();
        let author = db.add_user(false).await;
        let voters = [db.add_user(false).await, db.add_user(false).await];
        let p1 = db.add_post(author).await;
        let p2 = db.add_post(author).await;
        let c1 = db.add_comment(author, p1, None).await;
        db.force_votes(VotableId::Post(p1), &[(voters[0], 1), (voters[1], 1)]).await;
        db.force_votes(VotableId::Post(p2), &[(voters[0], -1)]).await;
        db.force_votes(VotableId::Comment(c1), &[(voters[1], 1)]).await;

        assert_eq!(recompute_karma(&mut db, author).await.unwrap(), 2);
        assert_eq!(db.karma_of(author).await, Some(2));
        // idempotent
        assert_eq!(recompute_karma(&mut db, author).await.unwrap(), 2);

        db.force_deleted(VotableId::Post(p2), true).await;
        assert_eq!(recompute_karma(&mut db, author).await.unwrap(), 3);
        db.force_deleted(VotableId::Post(p1), true).await;
        assert_eq!(recompute_karma(&mut db, author).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_users_and_store_failures() {
        let mut db = MemDb::new();
        let ghost = UserId(Uuid::new_v4());
        assert!(matches!(
            recompute_karma(&mut db, ghost).await,
            Err(Error::Api(ApiError::NotFound(u))) if u == ghost.0
        ));

        let user = db.add_user(false).await;
        db.fail_next_karma_writes(1).await;
        assert!(matches!(
            recompute_karma(&mut db, user).await,
            Err(Error::Api(ApiError::AggregationFailure(u))) if u == user.0
        ));
        assert_eq!(recompute_karma(&mut db, user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn worker_retries_until_success() {
        let db = MemDb::new();
        let author = db.add_user(false).await;
        let voter = db.add_user(false).await;
        let post = db.add_post(author).await;
        db.force_votes(VotableId::Post(post), &[(voter, 1)]).await;

        let (queue, worker) = KarmaQueue::spawn(db.clone(), fast());
        db.fail_next_karma_writes(3).await;
        queue.trigger(author);
        queue.flush().await.unwrap();

        let mut waited = 0;
        while db.karma_of(author).await != Some(1) {
            assert!(waited < 500, "karma never converged");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }

        std::mem::drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn worker_coalesces_and_flushes() {
        let db = MemDb::new();
        let authors = [db.add_user(false).await, db.add_user(false).await];
        let voter = db.add_user(false).await;
        let mut posts = Vec::new();
        for a in authors {
            posts.push(db.add_post(a).await);
        }

        let (queue, worker) = KarmaQueue::spawn(db.clone(), fast());
        for _ in 0..10 {
            for a in authors {
                queue.trigger(a);
            }
        }
        db.force_votes(VotableId::Post(posts[1]), &[(voter, -1)]).await;
        queue.trigger(authors[1]);
        queue.flush().await.unwrap();
        assert_eq!(db.karma_of(authors[0]).await, Some(0));
        assert_eq!(db.karma_of(authors[1]).await, Some(-1));

        // unknown users are dropped rather than retried forever
        queue.trigger(UserId(Uuid::new_v4()));
        queue.flush().await.unwrap();

        std::mem::drop(queue);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn triggers_do_not_bypass_the_backoff() {
        let db = MemDb::new();
        let stuck = db.add_user(false).await;
        let busy = db.add_user(false).await;
        let slow = KarmaConfig {
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(10),
        };
        let (queue, worker) = KarmaQueue::spawn(db.clone(), slow);
        db.fail_next_karma_writes(1000).await;
        queue.trigger(stuck);
        queue.flush().await.unwrap();
        assert_eq!(db.pending_karma_failures().await, 999);

        // each trigger recomputes its own user only, the stuck one waits for
        // its retry deadline
        for _ in 0..10 {
            queue.trigger(busy);
            queue.flush().await.unwrap();
        }
        assert_eq!(db.pending_karma_failures().await, 989);

        std::mem::drop(queue);
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker kept retrying after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_gives_up_on_persistent_failures() {
        let db = MemDb::new();
        let user = db.add_user(false).await;
        let (queue, worker) = KarmaQueue::spawn(db.clone(), fast());
        db.fail_next_karma_writes(usize::MAX).await;
        queue.trigger(user);
        queue.flush().await.unwrap();

        std::mem::drop(queue);
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker kept retrying after shutdown")
            .unwrap();
        assert_eq!(db.karma_of(user).await, Some(0));
        // retried during the grace period, then dropped
        assert!(db.pending_karma_failures().await < usize::MAX - 1);
    }
}
