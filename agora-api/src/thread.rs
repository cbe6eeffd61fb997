use crate::{CommentId, PostId, Ranking, Time, UserId};

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ListComments {
    pub post: PostId,

    /// Ordering of every sibling group, defaults to `Ranking::Top`
    #[serde(default)]
    pub ranking: Option<Ranking>,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentNode {
    pub id: CommentId,

    /// `None` for tombstones, ie. deleted comments kept so that their replies stay reachable
    pub content: Option<String>,
    pub author: Option<UserId>,
    pub deleted: bool,

    pub date: Time,
    pub score: i64,

    /// Transient annotation for the viewer, never persisted
    pub viewer_vote: Option<i64>,

    /// Direct replies, already ranked
    pub children: Vec<CommentNode>,
}

impl CommentNode {
    /// Number of nodes in this subtree, including self
    pub fn count(&self) -> usize {
        let mut res = 0;
        let mut stack = vec![self];
        while let Some(n) = stack.pop() {
            res += 1;
            stack.extend(n.children.iter());
        }
        res
    }
}
