use agora_api::{
    Actor, CastVote, CommentNode, Db, DbPool, ListComments, ListVotables, NewComment, NewPost,
    RankedVotable, SetDeleted, UserId, VoteResult,
};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    Json,
};

use crate::{extractors::*, Error};

pub async fn whoami(Auth(actor): Auth) -> Json<Actor> {
    Json(actor)
}

pub async fn vote<P: DbPool>(
    Auth(actor): Auth,
    State(state): State<AppState<P>>,
    mut conn: DbConn<P>,
    Json(req): Json<CastVote>,
) -> Result<Json<VoteResult>, Error> {
    Ok(Json(
        agora_engine::submit_vote(&mut *conn, &state.karma, state.policy, actor.user, &req)
            .await?,
    ))
}

pub async fn list_comments<P: DbPool>(
    MaybeAuth(actor): MaybeAuth,
    mut conn: DbConn<P>,
    Json(req): Json<ListComments>,
) -> Result<Json<Vec<CommentNode>>, Error> {
    Ok(Json(
        agora_engine::build_tree(
            &mut *conn,
            req.post,
            actor.map(|a| a.user),
            req.ranking.unwrap_or_default(),
            chrono::Utc::now(),
        )
        .await?,
    ))
}

pub async fn list_votables<P: DbPool>(
    MaybeAuth(actor): MaybeAuth,
    mut conn: DbConn<P>,
    Json(req): Json<ListVotables>,
) -> Result<Json<Vec<RankedVotable>>, Error> {
    Ok(Json(
        agora_engine::list_votables(&mut *conn, actor.map(|a| a.user), &req, chrono::Utc::now())
            .await?,
    ))
}

pub async fn karma<P: DbPool>(
    mut conn: DbConn<P>,
    Path(user): Path<UserId>,
) -> Result<Json<i64>, Error> {
    Ok(Json(
        conn.load_karma(user)
            .await
            .with_context(|| format!("loading karma of {:?}", user))?
            .ok_or(agora_api::Error::NotFound(user.0))?,
    ))
}

pub async fn create_post<P: DbPool>(
    Auth(actor): Auth,
    mut conn: DbConn<P>,
    Json(p): Json<NewPost>,
) -> Result<(), Error> {
    agora_engine::create_post(&mut *conn, actor, &p).await?;
    Ok(())
}

pub async fn create_comment<P: DbPool>(
    Auth(actor): Auth,
    mut conn: DbConn<P>,
    Json(c): Json<NewComment>,
) -> Result<(), Error> {
    agora_engine::create_comment(&mut *conn, actor, &c).await?;
    Ok(())
}

pub async fn set_deleted<P: DbPool>(
    Auth(actor): Auth,
    State(state): State<AppState<P>>,
    mut conn: DbConn<P>,
    Json(req): Json<SetDeleted>,
) -> Result<(), Error> {
    agora_engine::set_deleted(&mut *conn, &state.karma, actor, &req).await?;
    Ok(())
}

pub async fn admin_recompute_karma<P: DbPool>(
    AdminAuth: AdminAuth,
    mut conn: DbConn<P>,
    Path(user): Path<UserId>,
) -> Result<Json<i64>, Error> {
    tracing::info!(?user, "karma recompute requested by admin");
    Ok(Json(agora_engine::recompute_karma(&mut *conn, user).await?))
}
