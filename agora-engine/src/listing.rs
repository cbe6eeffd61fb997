use anyhow::Context;

use crate::{
    api::{Db, ListVotables, RankedVotable, Scope, Stored, Time, UserId, Vote},
    Error, RankingExt,
};

/// One page of the non-deleted votables of a scope, in ranking order
pub async fn list_votables<D: Db>(
    db: &mut D,
    viewer: Option<UserId>,
    req: &ListVotables,
    now: Time,
) -> Result<Vec<RankedVotable>, Error> {
    req.validate()?;
    if let Scope::PostComments(post) = req.scope {
        match db
            .load_post(post)
            .await
            .with_context(|| format!("loading post {:?}", post))?
        {
            Some(p) if !p.votable.deleted => (),
            _ => return Err(Error::not_found(post.0)),
        }
    }
    let mut items = db
        .load_scope(&req.scope)
        .await
        .with_context(|| format!("loading votables in scope {:?}", req.scope))?;
    items.retain(|i| !i.votable().deleted);
    req.ranking.sort(&mut items, now);

    let page_size = req.clamped_page_size();
    Ok(items
        .into_iter()
        .skip(req.page.saturating_mul(page_size))
        .take(page_size)
        .map(|i| {
            let v = i.votable();
            let viewer_vote = viewer.map(|u| Vote::value_of(v.vote_of(&u)));
            let (id, author, date, score) = (v.id, v.author, v.date, v.score);
            let (title, content) = match i {
                Stored::Post(p) => (Some(p.title), p.content),
                Stored::Comment(c) => (None, c.content),
            };
            RankedVotable {
                id,
                author,
                date,
                score,
                title,
                content,
                viewer_vote,
            }
        })
        .collect())
}
