use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::api::{
    Actor, AuthToken, AuthoredScore, CommentId, Db, DbPool, NewComment, NewPost, PostId, Scope,
    Stored, StoredComment, StoredPost, Time, UserId, Uuid, Votable, VotableId, Vote, VoteSet,
};

#[derive(Debug, Default)]
struct MemState {
    users: HashMap<UserId, MemUser>,
    sessions: HashMap<AuthToken, UserId>,
    posts: BTreeMap<PostId, StoredPost>,
    comments: BTreeMap<CommentId, StoredComment>,

    failing_votable_writes: usize,
    failing_karma_writes: usize,
}

#[derive(Debug)]
struct MemUser {
    is_admin: bool,
    karma: i64,
}

impl MemState {
    fn votable_mut(&mut self, id: VotableId) -> Option<&mut Votable> {
        match id {
            VotableId::Post(p) => self.posts.get_mut(&p).map(|p| &mut p.votable),
            VotableId::Comment(c) => self.comments.get_mut(&c).map(|c| &mut c.votable),
        }
    }

    fn uuid_used(&self, id: Uuid) -> bool {
        self.posts.contains_key(&PostId(id)) || self.comments.contains_key(&CommentId(id))
    }
}

/// In-memory store, shared between all its clones
///
/// Every clone is both a pool and a connection. Used for tests and for running
/// a throwaway server without a database.
#[derive(Clone, Debug, Default)]
pub struct MemDb(Arc<Mutex<MemState>>);

impl MemDb {
    pub fn new() -> MemDb {
        MemDb::default()
    }

    pub async fn add_user(&self, is_admin: bool) -> UserId {
        let id = UserId(Uuid::new_v4());
        self.0
            .lock()
            .await
            .users
            .insert(id, MemUser { is_admin, karma: 0 });
        id
    }

    pub async fn open_session(&self, user: UserId) -> AuthToken {
        let token = AuthToken(Uuid::new_v4());
        self.0.lock().await.sessions.insert(token, user);
        token
    }

    pub async fn add_post(&self, author: UserId) -> PostId {
        self.add_post_at(author, chrono::Utc::now()).await
    }

    pub async fn add_post_at(&self, author: UserId, date: Time) -> PostId {
        let id = PostId(Uuid::new_v4());
        self.0.lock().await.posts.insert(
            id,
            StoredPost {
                votable: Votable::new(VotableId::Post(id), author, date),
                title: String::from("title"),
                content: String::from("content"),
                community: None,
            },
        );
        id
    }

    /// Adds a comment without any check on its parent
    pub async fn add_comment(
        &self,
        author: UserId,
        post: PostId,
        parent: Option<CommentId>,
    ) -> CommentId {
        let id = CommentId(Uuid::new_v4());
        self.0.lock().await.comments.insert(
            id,
            StoredComment {
                votable: Votable::new(VotableId::Comment(id), author, chrono::Utc::now()),
                post,
                parent,
                content: String::from("content"),
            },
        );
        id
    }

    /// Replaces the whole vote set of a votable, keeping its score consistent
    ///
    /// Panics on unknown votables or invalid vote values.
    pub async fn force_votes(&self, id: VotableId, votes: &[(UserId, i64)]) {
        let mut state = self.0.lock().await;
        let v = state.votable_mut(id).expect("forcing votes on unknown votable");
        v.votes = votes
            .iter()
            .filter_map(|(u, value)| {
                Vote::from_value(*value)
                    .expect("forcing invalid vote value")
                    .map(|vote| (*u, vote))
            })
            .collect::<VoteSet>();
        v.score = v.votes.iter().map(|(_, vote)| vote.value()).sum();
        v.revision += 1;
    }

    /// Panics on unknown votables
    pub async fn force_deleted(&self, id: VotableId, deleted: bool) {
        let mut state = self.0.lock().await;
        let v = state.votable_mut(id).expect("deleting unknown votable");
        v.deleted = deleted;
        v.revision += 1;
    }

    pub async fn karma_of(&self, user: UserId) -> Option<i64> {
        self.0.lock().await.users.get(&user).map(|u| u.karma)
    }

    /// Makes the next `n` votable writes fail like a lost database would
    pub async fn fail_next_votable_writes(&self, n: usize) {
        self.0.lock().await.failing_votable_writes = n;
    }

    pub async fn fail_next_karma_writes(&self, n: usize) {
        self.0.lock().await.failing_karma_writes = n;
    }

    /// How many of the injected karma write failures are still to come
    pub async fn pending_karma_failures(&self) -> usize {
        self.0.lock().await.failing_karma_writes
    }
}

#[async_trait]
impl Db for MemDb {
    async fn recover_session(&mut self, token: AuthToken) -> anyhow::Result<Option<Actor>> {
        let state = self.0.lock().await;
        Ok(state.sessions.get(&token).and_then(|user| {
            state.users.get(user).map(|u| Actor {
                user: *user,
                is_admin: u.is_admin,
            })
        }))
    }

    async fn create_post(&mut self, p: &NewPost) -> anyhow::Result<bool> {
        let mut state = self.0.lock().await;
        if state.uuid_used(p.id.0) {
            return Ok(false);
        }
        state.posts.insert(
            p.id,
            StoredPost {
                votable: Votable::new(VotableId::Post(p.id), p.author, p.date),
                title: p.title.clone(),
                content: p.content.clone(),
                community: p.community.clone(),
            },
        );
        Ok(true)
    }

    async fn create_comment(&mut self, c: &NewComment) -> anyhow::Result<bool> {
        let mut state = self.0.lock().await;
        if state.uuid_used(c.id.0) {
            return Ok(false);
        }
        state.comments.insert(
            c.id,
            StoredComment {
                votable: Votable::new(VotableId::Comment(c.id), c.author, c.date),
                post: c.post,
                parent: c.parent,
                content: c.content.clone(),
            },
        );
        Ok(true)
    }

    async fn load_votable(&mut self, id: VotableId) -> anyhow::Result<Option<Votable>> {
        let res = self.0.lock().await.votable_mut(id).cloned();
        // Let concurrent writers interleave between load and store
        tokio::task::yield_now().await;
        Ok(res)
    }

    async fn store_votable(&mut self, v: &Votable, expected_revision: i64) -> anyhow::Result<bool> {
        let mut state = self.0.lock().await;
        if state.failing_votable_writes > 0 {
            state.failing_votable_writes -= 1;
            anyhow::bail!("injected failure storing votable {:?}", v.id);
        }
        let stored = state
            .votable_mut(v.id)
            .ok_or_else(|| anyhow::anyhow!("storing unknown votable {:?}", v.id))?;
        if stored.revision != expected_revision {
            return Ok(false);
        }
        stored.votes = v.votes.clone();
        stored.score = v.score;
        stored.deleted = v.deleted;
        stored.revision = v.revision;
        Ok(true)
    }

    async fn load_post(&mut self, id: PostId) -> anyhow::Result<Option<StoredPost>> {
        Ok(self.0.lock().await.posts.get(&id).cloned())
    }

    async fn load_comment(&mut self, id: CommentId) -> anyhow::Result<Option<StoredComment>> {
        Ok(self.0.lock().await.comments.get(&id).cloned())
    }

    async fn load_post_comments(&mut self, post: PostId) -> anyhow::Result<Vec<StoredComment>> {
        Ok(self
            .0
            .lock()
            .await
            .comments
            .values()
            .filter(|c| c.post == post)
            .cloned()
            .collect())
    }

    async fn load_scope(&mut self, scope: &Scope) -> anyhow::Result<Vec<Stored>> {
        let state = self.0.lock().await;
        let posts = state.posts.values().filter(|p| match scope {
            Scope::AllPosts => true,
            Scope::Community(c) => p.community.as_ref() == Some(c),
            Scope::PostComments(_) => false,
            Scope::AuthoredBy(u) => p.votable.author == *u,
        });
        let comments = state.comments.values().filter(|c| match scope {
            Scope::AllPosts | Scope::Community(_) => false,
            Scope::PostComments(p) => c.post == *p,
            Scope::AuthoredBy(u) => c.votable.author == *u,
        });
        Ok(posts
            .cloned()
            .map(Stored::Post)
            .chain(comments.cloned().map(Stored::Comment))
            .filter(|s| !s.votable().deleted)
            .collect())
    }

    async fn load_authored(&mut self, user: UserId) -> anyhow::Result<Vec<AuthoredScore>> {
        let state = self.0.lock().await;
        Ok(state
            .posts
            .values()
            .map(|p| &p.votable)
            .chain(state.comments.values().map(|c| &c.votable))
            .filter(|v| v.author == user)
            .map(|v| AuthoredScore {
                id: v.id,
                score: v.score,
                deleted: v.deleted,
            })
            .collect())
    }

    async fn load_karma(&mut self, user: UserId) -> anyhow::Result<Option<i64>> {
        Ok(self.karma_of(user).await)
    }

    async fn store_karma(&mut self, user: UserId, karma: i64) -> anyhow::Result<bool> {
        let mut state = self.0.lock().await;
        if state.failing_karma_writes > 0 {
            state.failing_karma_writes -= 1;
            anyhow::bail!("injected failure storing karma of {:?}", user);
        }
        match state.users.get_mut(&user) {
            Some(u) => {
                u.karma = karma;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl DbPool for MemDb {
    type Conn = MemDb;

    async fn acquire(&self) -> anyhow::Result<MemDb> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_revisions_are_refused() {
        let mut db = MemDb::new();
        let author = db.add_user(false).await;
        let voter = db.add_user(false).await;
        let post = VotableId::Post(db.add_post(author).await);

        let mut first = db.load_votable(post).await.unwrap().unwrap();
        let mut second = first.clone();
        first.votes = VoteSet::from_iter([(voter, Vote::Up)]);
        first.score = 1;
        first.revision += 1;
        assert!(db.store_votable(&first, 0).await.unwrap());

        second.deleted = true;
        second.revision += 1;
        assert!(!db.store_votable(&second, 0).await.unwrap());
        assert_eq!(db.load_votable(post).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn sessions() {
        let mut db = MemDb::new();
        let admin = db.add_user(true).await;
        let token = db.open_session(admin).await;
        assert_eq!(
            db.recover_session(token).await.unwrap(),
            Some(Actor {
                user: admin,
                is_admin: true
            })
        );
        assert_eq!(db.recover_session(AuthToken::stub()).await.unwrap(), None);
    }
}
