use std::ops::{Deref, DerefMut};

use agora_api::{Actor, AuthToken, Db, DbPool, Uuid};
use agora_engine::{KarmaQueue, VotePolicy};
use anyhow::Context;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{self, request},
};

use crate::Error;

#[derive(Clone)]
pub struct AppState<P> {
    pub pool: P,
    pub karma: KarmaQueue,
    pub admin_token: Option<AuthToken>,
    pub policy: VotePolicy,
}

pub struct DbConn<P: DbPool>(pub P::Conn);

#[async_trait]
impl<P: DbPool> FromRequestParts<AppState<P>> for DbConn<P> {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState<P>,
    ) -> Result<DbConn<P>, Error> {
        Ok(DbConn(
            state.pool.acquire().await.context("acquiring db connection")?,
        ))
    }
}

impl<P: DbPool> Deref for DbConn<P> {
    type Target = P::Conn;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<P: DbPool> DerefMut for DbConn<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Bearer token, not yet checked against the sessions
pub struct PreAuth(pub AuthToken);

/// `Bearer <uuid>`, the scheme being case-insensitive
fn parse_bearer(header: &http::HeaderValue) -> Option<AuthToken> {
    let (scheme, token) = header.to_str().ok()?.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.contains(' ') {
        return None;
    }
    Uuid::try_parse(token).ok().map(AuthToken)
}

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        req.headers
            .get(http::header::AUTHORIZATION)
            .and_then(parse_bearer)
            .map(PreAuth)
            .ok_or_else(Error::unauthenticated)
    }
}

async fn recover_actor<P: DbPool>(state: &AppState<P>, token: AuthToken) -> Result<Actor, Error> {
    let mut conn = state.pool.acquire().await.context("acquiring db connection")?;
    conn.recover_session(token)
        .await
        .context("recovering session")?
        .ok_or(Error::unauthenticated())
}

pub struct Auth(pub Actor);

#[async_trait]
impl<P: DbPool> FromRequestParts<AppState<P>> for Auth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState<P>,
    ) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        Ok(Auth(recover_actor(state, token).await?))
    }
}

/// Anonymous requests are fine, but a token that is sent must be valid
pub struct MaybeAuth(pub Option<Actor>);

#[async_trait]
impl<P: DbPool> FromRequestParts<AppState<P>> for MaybeAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState<P>,
    ) -> Result<MaybeAuth, Error> {
        if !req.headers.contains_key(http::header::AUTHORIZATION) {
            return Ok(MaybeAuth(None));
        }
        Ok(MaybeAuth(Some(Auth::from_request_parts(req, state).await?.0)))
    }
}

/// Either the configured admin token, or the session of an admin user
pub struct AdminAuth;

#[async_trait]
impl<P: DbPool> FromRequestParts<AppState<P>> for AdminAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState<P>,
    ) -> Result<AdminAuth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        if Some(token) == state.admin_token {
            return Ok(AdminAuth);
        }
        if recover_actor(state, token).await?.is_admin {
            Ok(AdminAuth)
        } else {
            Err(Error::permission_denied())
        }
    }
}
