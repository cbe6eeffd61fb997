use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{Error, Time, UserId, STUB_UUID};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct PostId(pub Uuid);

impl PostId {
    pub fn stub() -> PostId {
        PostId(STUB_UUID)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn stub() -> CommentId {
        CommentId(STUB_UUID)
    }
}

/// Anything that can accumulate votes
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(tag = "type", content = "id", rename_all = "kebab-case")]
pub enum VotableId {
    Post(PostId),
    Comment(CommentId),
}

impl VotableId {
    pub fn uuid(&self) -> Uuid {
        match self {
            VotableId::Post(p) => p.0,
            VotableId::Comment(c) => c.0,
        }
    }
}

impl From<PostId> for VotableId {
    fn from(p: PostId) -> VotableId {
        VotableId::Post(p)
    }
}

impl From<CommentId> for VotableId {
    fn from(c: CommentId) -> VotableId {
        VotableId::Comment(c)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Vote {
    Up,
    Down,
}

impl Vote {
    pub fn value(self) -> i64 {
        match self {
            Vote::Up => 1,
            Vote::Down => -1,
        }
    }

    /// Parses a wire value, `0` meaning "no vote"
    pub fn from_value(value: i64) -> Result<Option<Vote>, Error> {
        match value {
            1 => Ok(Some(Vote::Up)),
            0 => Ok(None),
            -1 => Ok(Some(Vote::Down)),
            v => Err(Error::InvalidValue(v)),
        }
    }

    pub fn value_of(vote: Option<Vote>) -> i64 {
        vote.map(Vote::value).unwrap_or(0)
    }
}

/// At most one vote per voter
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VoteSet(pub BTreeMap<UserId, Vote>);

impl VoteSet {
    pub fn new() -> VoteSet {
        VoteSet(BTreeMap::new())
    }

    pub fn get(&self, voter: &UserId) -> Option<Vote> {
        self.0.get(voter).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &Vote)> {
        self.0.iter()
    }
}

impl FromIterator<(UserId, Vote)> for VoteSet {
    fn from_iter<I: IntoIterator<Item = (UserId, Vote)>>(iter: I) -> VoteSet {
        VoteSet(iter.into_iter().collect())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Votable {
    pub id: VotableId,
    pub author: UserId,
    pub date: Time,
    pub deleted: bool,
    pub votes: VoteSet,

    /// Cached sum of `votes`, never trusted on its own
    pub score: i64,

    /// Bumped by every successful store, used to detect concurrent writers
    pub revision: i64,
}

impl Votable {
    pub fn new(id: VotableId, author: UserId, date: Time) -> Votable {
        Votable {
            id,
            author,
            date,
            deleted: false,
            votes: VoteSet::new(),
            score: 0,
            revision: 0,
        }
    }

    pub fn vote_of(&self, voter: &UserId) -> Option<Vote> {
        self.votes.get(voter)
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct CastVote {
    pub votable: VotableId,
    pub value: i64,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct VoteResult {
    pub score: i64,

    /// Echoes the value just applied, 0 if the vote was retracted
    pub voter_value: i64,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewPost {
    pub id: PostId,
    pub author: UserId,
    pub date: Time,
    pub title: String,
    pub content: String,
    pub community: Option<String>,
}

impl NewPost {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.title)?;
        crate::validate_string(&self.content)?;
        if let Some(c) = &self.community {
            crate::validate_string(c)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub id: CommentId,
    pub post: PostId,
    pub parent: Option<CommentId>,
    pub author: UserId,
    pub date: Time,
    pub content: String,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.content)
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct SetDeleted {
    pub votable: VotableId,
    pub deleted: bool,
}
