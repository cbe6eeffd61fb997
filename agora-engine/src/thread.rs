use std::collections::HashMap;

use anyhow::Context;

use crate::{
    api::{CommentId, CommentNode, Db, PostId, Ranking, StoredComment, Time, UserId, Vote},
    Error, RankingExt,
};

/// Builds the reply forest of `post`, every sibling group ranked by `ranking`
///
/// Deleted comments that still have live replies are kept as tombstones
/// (no content, no author) so that the replies stay reachable. Deleted comments
/// without live replies are left out.
pub async fn build_tree<D: Db>(
    db: &mut D,
    post: PostId,
    viewer: Option<UserId>,
    ranking: Ranking,
    now: Time,
) -> Result<Vec<CommentNode>, Error> {
    if db
        .load_post(post)
        .await
        .with_context(|| format!("loading post {:?}", post))?
        .is_none()
    {
        return Err(Error::not_found(post.0));
    }
    let comments = db
        .load_post_comments(post)
        .await
        .with_context(|| format!("loading comments of post {:?}", post))?;
    Ok(assemble_thread(post, comments, viewer, ranking, now))
}

pub fn assemble_thread(
    post: PostId,
    comments: Vec<StoredComment>,
    viewer: Option<UserId>,
    ranking: Ranking,
    now: Time,
) -> Vec<CommentNode> {
    let comments = comments
        .into_iter()
        .map(|c| (c.id(), c))
        .collect::<HashMap<CommentId, StoredComment>>();

    let mut children = HashMap::<Option<CommentId>, Vec<&StoredComment>>::new();
    for c in comments.values() {
        let parent = match c.parent {
            Some(p) if comments.contains_key(&p) => Some(p),
            Some(p) => {
                tracing::warn!(comment = ?c.id(), parent = ?p, ?post, "comment parent is missing, showing it at top level");
                None
            }
            None => None,
        };
        children.entry(parent).or_default().push(c);
    }
    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| ranking.compare(&a.votable, &b.votable, now));
    }

    // Pre-order walk with an explicit stack, so that thread depth is not bounded
    // by the call stack
    let mut order = Vec::with_capacity(comments.len());
    let mut stack = children
        .get(&None)
        .map(|roots| roots.iter().rev().copied().collect::<Vec<_>>())
        .unwrap_or_default();
    while let Some(c) = stack.pop() {
        order.push(c);
        if let Some(replies) = children.get(&Some(c.id())) {
            stack.extend(replies.iter().rev().copied());
        }
    }
    if order.len() != comments.len() {
        tracing::warn!(
            ?post,
            unreachable = comments.len() - order.len(),
            "comments unreachable from any root, they must be part of a parent cycle"
        );
    }

    // Reverse pre-order sees all the replies of a comment before the comment itself
    let mut built = HashMap::<CommentId, CommentNode>::with_capacity(order.len());
    for c in order.into_iter().rev() {
        let id = c.id();
        let replies = children
            .get(&Some(id))
            .into_iter()
            .flatten()
            .filter_map(|r| built.remove(&r.id()))
            .collect::<Vec<_>>();
        let deleted = c.votable.deleted;
        if deleted && replies.is_empty() {
            continue;
        }
        built.insert(
            id,
            CommentNode {
                id,
                content: (!deleted).then(|| c.content.clone()),
                author: (!deleted).then_some(c.votable.author),
                deleted,
                date: c.votable.date,
                score: c.votable.score,
                viewer_vote: viewer.map(|v| Vote::value_of(c.votable.vote_of(&v))),
                children: replies,
            },
        );
    }

    children
        .get(&None)
        .into_iter()
        .flatten()
        .filter_map(|c| built.remove(&c.id()))
        .collect()
}
