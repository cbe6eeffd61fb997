use anyhow::Context;

use crate::{
    api::{Actor, Db, NewComment, NewPost},
    Error,
};

pub async fn create_post<D: Db>(db: &mut D, actor: Actor, p: &NewPost) -> Result<(), Error> {
    p.validate()?;
    if p.author != actor.user {
        return Err(Error::permission_denied());
    }
    if !db
        .create_post(p)
        .await
        .with_context(|| format!("creating post {:?}", p.id))?
    {
        return Err(Error::uuid_already_used(p.id.0));
    }
    tracing::debug!(post = ?p.id, author = ?p.author, "created post");
    Ok(())
}

/// Creates a comment, making sure the reply graph of each post stays a tree
///
/// The parent must be an existing, non-deleted comment of the same post.
pub async fn create_comment<D: Db>(db: &mut D, actor: Actor, c: &NewComment) -> Result<(), Error> {
    c.validate()?;
    if c.author != actor.user {
        return Err(Error::permission_denied());
    }
    match db
        .load_post(c.post)
        .await
        .with_context(|| format!("loading post {:?}", c.post))?
    {
        Some(p) if !p.votable.deleted => (),
        _ => return Err(Error::not_found(c.post.0)),
    }
    if let Some(parent_id) = c.parent {
        if parent_id == c.id {
            return Err(Error::acyclic_violation());
        }
        let parent = db
            .load_comment(parent_id)
            .await
            .with_context(|| format!("loading parent comment {:?}", parent_id))?
            .ok_or_else(Error::acyclic_violation)?;
        if parent.post != c.post {
            return Err(Error::acyclic_violation());
        }
        if parent.votable.deleted {
            return Err(Error::not_found(parent_id.0));
        }
    }
    if !db
        .create_comment(c)
        .await
        .with_context(|| format!("creating comment {:?}", c.id))?
    {
        return Err(Error::uuid_already_used(c.id.0));
    }
    tracing::debug!(comment = ?c.id, post = ?c.post, parent = ?c.parent, "created comment");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{CommentId, Error as ApiError, PostId, Uuid, VotableId},
        MemDb,
    };

    fn new_comment(author: Actor, post: PostId, parent: Option<CommentId>) -> NewComment {
        NewComment {
            id: CommentId(Uuid::new_v4()),
            post,
            parent,
            author: author.user,
            date: chrono::Utc::now(),
            content: String::from("first!"),
        }
    }

    #[tokio::test]
    async fn posts() {
        let mut db = MemDb::new();
        let alice = Actor {
            user: db.add_user(false).await,
            is_admin: false,
        };
        let p = NewPost {
            id: PostId(Uuid::new_v4()),
            author: alice.user,
            date: chrono::Utc::now(),
            title: String::from("hello"),
            content: String::from("world"),
            community: None,
        };
        create_post(&mut db, alice, &p).await.unwrap();
        let err = create_post(&mut db, alice, &p).await.unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::UuidAlreadyUsed(p.id.0)));

        let mallory = Actor {
            user: db.add_user(false).await,
            is_admin: true,
        };
        let err = create_post(&mut db, mallory, &NewPost { id: PostId(Uuid::new_v4()), ..p.clone() })
            .await
            .unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::PermissionDenied));

        let err = create_post(&mut db, alice, &NewPost { id: PostId(Uuid::new_v4()), title: String::from("\0"), ..p })
            .await
            .unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::NullByteInString(String::from("\0"))));
    }

    #[tokio::test]
    async fn comment_parents_must_form_a_tree() {
        let mut db = MemDb::new();
        let alice = Actor {
            user: db.add_user(false).await,
            is_admin: false,
        };
        let post = db.add_post(alice.user).await;
        let other_post = db.add_post(alice.user).await;

        let root = new_comment(alice, post, None);
        create_comment(&mut db, alice, &root).await.unwrap();
        create_comment(&mut db, alice, &new_comment(alice, post, Some(root.id)))
            .await
            .unwrap();

        // self-reference
        let mut selfish = new_comment(alice, post, None);
        selfish.parent = Some(selfish.id);
        let err = create_comment(&mut db, alice, &selfish).await.unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::AcyclicViolation));

        // cross-post reference
        let err = create_comment(&mut db, alice, &new_comment(alice, other_post, Some(root.id)))
            .await
            .unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::AcyclicViolation));

        // unknown parent
        let ghost = CommentId(Uuid::new_v4());
        let err = create_comment(&mut db, alice, &new_comment(alice, post, Some(ghost)))
            .await
            .unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::AcyclicViolation));

        // unknown post
        let ghost = PostId(Uuid::new_v4());
        let err = create_comment(&mut db, alice, &new_comment(alice, ghost, None))
            .await
            .unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::NotFound(ghost.0)));

        // deleted parent
        db.force_deleted(VotableId::Comment(root.id), true).await;
        let err = create_comment(&mut db, alice, &new_comment(alice, post, Some(root.id)))
            .await
            .unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::NotFound(root.id.0)));

        // a comment id can not reuse a post id
        let mut clash = new_comment(alice, post, None);
        clash.id = CommentId(other_post.0);
        let err = create_comment(&mut db, alice, &clash).await.unwrap_err();
        assert_eq!(err.api(), Some(&ApiError::UuidAlreadyUsed(other_post.0)));
    }
}
