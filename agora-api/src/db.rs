use async_trait::async_trait;

use crate::{
    Actor, AuthToken, CommentId, NewComment, NewPost, PostId, Scope, UserId, Votable, VotableId,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredPost {
    pub votable: Votable,
    pub title: String,
    pub content: String,
    pub community: Option<String>,
}

impl StoredPost {
    pub fn id(&self) -> PostId {
        PostId(self.votable.id.uuid())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredComment {
    pub votable: Votable,
    pub post: PostId,
    pub parent: Option<CommentId>,
    pub content: String,
}

impl StoredComment {
    pub fn id(&self) -> CommentId {
        CommentId(self.votable.id.uuid())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Stored {
    Post(StoredPost),
    Comment(StoredComment),
}

impl Stored {
    pub fn votable(&self) -> &Votable {
        match self {
            Stored::Post(p) => &p.votable,
            Stored::Comment(c) => &c.votable,
        }
    }
}

/// What the karma aggregation needs to know about one piece of authored content
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AuthoredScore {
    pub id: VotableId,
    pub score: i64,
    pub deleted: bool,
}

/// Persistence collaborator
///
/// Implementations must propagate storage failures (timeouts, lost connections...)
/// as errors, never as empty results.
#[async_trait]
pub trait Db: Send {
    async fn recover_session(&mut self, token: AuthToken) -> anyhow::Result<Option<Actor>>;

    /// Returns false if the id is already taken
    async fn create_post(&mut self, p: &NewPost) -> anyhow::Result<bool>;

    /// Returns false if the id is already taken. The parent must have been checked
    /// by the caller.
    async fn create_comment(&mut self, c: &NewComment) -> anyhow::Result<bool>;

    async fn load_votable(&mut self, id: VotableId) -> anyhow::Result<Option<Votable>>;

    /// Stores the vote set, score and deletion flag of `v` as a single unit, only
    /// if the stored revision is still `expected_revision`. The stored revision
    /// then becomes `v.revision`.
    ///
    /// Returns false without writing anything if another writer got there first.
    async fn store_votable(&mut self, v: &Votable, expected_revision: i64)
        -> anyhow::Result<bool>;

    async fn load_post(&mut self, id: PostId) -> anyhow::Result<Option<StoredPost>>;

    async fn load_comment(&mut self, id: CommentId) -> anyhow::Result<Option<StoredComment>>;

    /// All the comments of `post`, deleted ones included, in one go
    async fn load_post_comments(&mut self, post: PostId) -> anyhow::Result<Vec<StoredComment>>;

    /// All the non-deleted votables in `scope`, in no particular order
    async fn load_scope(&mut self, scope: &Scope) -> anyhow::Result<Vec<Stored>>;

    /// Posts and comments authored by `user`, deleted ones included
    async fn load_authored(&mut self, user: UserId) -> anyhow::Result<Vec<AuthoredScore>>;

    async fn load_karma(&mut self, user: UserId) -> anyhow::Result<Option<i64>>;

    /// Returns false if the user does not exist
    async fn store_karma(&mut self, user: UserId, karma: i64) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait DbPool: 'static + Clone + Send + Sync {
    type Conn: Db;

    async fn acquire(&self) -> anyhow::Result<Self::Conn>;
}
