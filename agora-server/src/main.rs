use std::{net::SocketAddr, time::Duration};

use agora_api::{AuthToken, DbPool, Uuid};
use agora_engine::{KarmaConfig, KarmaQueue, VotePolicy};
use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use structopt::StructOpt;

mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;

use db::PgPool;
use error::Error;
use extractors::AppState;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, StructOpt)]
#[structopt(name = "agora-server", about = "Voting, karma and comment threads server")]
struct Opt {
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    #[structopt(long, env = "AGORA_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Token granting access to the admin endpoints
    #[structopt(long, env = "ADMIN_TOKEN")]
    admin_token: Option<Uuid>,

    /// Refuse votes cast by the author of the content
    #[structopt(long)]
    disallow_self_votes: bool,

    #[structopt(long, default_value = "100")]
    karma_retry_base_ms: u64,

    #[structopt(long, default_value = "30000")]
    karma_retry_max_ms: u64,

    /// How long failing karma recomputes are still retried on shutdown
    #[structopt(long, default_value = "5000")]
    karma_shutdown_grace_ms: u64,
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<PgPool> {
    Ok(PgPool::new(
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(db_url)
            .await
            .with_context(|| format!("opening database {:?}", db_url))?,
    ))
}

pub fn app<P: DbPool>(state: AppState<P>) -> Router {
    use handlers::*;
    Router::new()
        .route("/api/whoami", get(whoami))
        .route("/api/vote", post(vote::<P>))
        .route("/api/comments", post(list_comments::<P>))
        .route("/api/votables", post(list_votables::<P>))
        .route("/api/users/:id/karma", get(karma::<P>))
        .route("/api/post", post(create_post::<P>))
        .route("/api/comment", post(create_comment::<P>))
        .route("/api/delete", post(set_deleted::<P>))
        .route(
            "/api/admin/recompute-karma/:id",
            post(admin_recompute_karma::<P>),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed listening for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opt = Opt::from_args();

    let pool = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(pool.inner())
        .await
        .context("running pending migrations")?;

    let (karma, karma_worker) = KarmaQueue::spawn(
        pool.clone(),
        KarmaConfig {
            retry_base: Duration::from_millis(opt.karma_retry_base_ms),
            retry_max: Duration::from_millis(opt.karma_retry_max_ms),
            shutdown_grace: Duration::from_millis(opt.karma_shutdown_grace_ms),
        },
    );
    let state = AppState {
        pool,
        karma: karma.clone(),
        admin_token: opt.admin_token.map(AuthToken),
        policy: VotePolicy {
            allow_self_votes: !opt.disallow_self_votes,
        },
    };
    let app = app(state).layer(tower_http::trace::TraceLayer::new_for_http());

    tracing::info!(listen = %opt.listen, "listening");
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum webserver")?;

    // the router is gone, let the worker drain what is left
    karma.flush().await?;
    std::mem::drop(karma);
    karma_worker.await.context("waiting for the karma worker")?;
    Ok(())
}
