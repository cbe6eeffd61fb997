use crate::{Error, PostId, Time, UserId, VotableId, MAX_PAGE_SIZE};

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ranking {
    /// Newest first
    New,

    /// Highest score first, newest first among equal scores
    #[default]
    Top,

    /// Score decayed by age, see `HOT_GRAVITY` in the engine
    Hot,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Scope {
    AllPosts,
    Community(String),

    /// All the comments of a post, as a flat list
    PostComments(PostId),

    /// Posts and comments authored by a user
    AuthoredBy(UserId),
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ListVotables {
    pub scope: Scope,
    pub ranking: Ranking,
    pub page: usize,
    pub page_size: usize,
}

impl ListVotables {
    pub fn validate(&self) -> Result<(), Error> {
        if let Scope::Community(c) = &self.scope {
            crate::validate_string(c)?;
        }
        Ok(())
    }

    pub fn clamped_page_size(&self) -> usize {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RankedVotable {
    pub id: VotableId,
    pub author: UserId,
    pub date: Time,
    pub score: i64,

    /// Only set for posts
    pub title: Option<String>,
    pub content: String,

    /// The viewer's own vote, only set when the request was authenticated
    pub viewer_vote: Option<i64>,
}
