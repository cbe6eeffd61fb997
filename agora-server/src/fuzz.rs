#![cfg(test)]

use std::{fmt::Debug, panic::AssertUnwindSafe, path::Path, time::Instant};

use agora_api::{
    AuthToken, CastVote, CommentId, CommentNode, DbPool, Error as ApiError, ListComments, ListVotables,
    NewComment, NewPost, PostId, RankedVotable, Ranking, Scope, SetDeleted, Time, UserId, Uuid,
    VotableId, VoteResult,
};
use agora_engine::{KarmaConfig, KarmaQueue, MemDb, VotePolicy};
use agora_mock_server::MockServer;
use async_recursion::async_recursion;
use bolero::generator::{bolero_generator, TypeGenerator};
use axum::{async_trait, body::Body, extract::FromRequestParts, http, Router};
use chrono::TimeZone;
use tower::{Service, ServiceExt};

use crate::{extractors::*, *};

fn single_threaded_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building tokio runtime")
}

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(single_threaded_runtime());
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |input| runtime.block_on($fn(input)))
        }
    };
}

/// Cluster backed by the most recent postgres found in `PATH`
fn build_pg_cluster(data: &Path) -> postgresfixture::cluster::Cluster {
    let mut newest = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(version) = r.version() {
            if newest.as_ref().map_or(true, |(v, _)| *v < version) {
                newest = Some((version, r));
            }
        }
    }
    let (_, runtime) = newest.expect("no postgres binaries found in PATH");
    postgresfixture::cluster::Cluster::new(data, runtime)
}

async fn open_test_db(socket_dir: &str) -> db::PgPool {
    let pool = create_sqlx_pool(&format!("postgresql://?host={socket_dir}&dbname=test_db"))
        .await
        .expect("connecting to test_db");
    MIGRATOR
        .run(pool.inner())
        .await
        .expect("migrating test_db");
    pool
}

/// Number of idle connections once the pool got back what it had lent, or
/// whatever it has after a second
async fn idle_after_release(pool: &db::PgPool, idle_before: usize) -> usize {
    let start = Instant::now();
    loop {
        let idle = pool.num_idle();
        if idle >= idle_before || start.elapsed() > std::time::Duration::from_secs(1) {
            return idle;
        }
        tokio::task::yield_now().await;
    }
}

// Runs only when AGORA_PG_TESTS is set, as it needs postgres installed locally
macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        fn $name() {
            if std::env::var("AGORA_PG_TESTS").is_err() {
                return;
            }
            if std::env::var("RUST_LOG").is_ok() {
                tracing_subscriber::fmt::init();
            }
            let datadir = tempfile::tempdir().expect("creating postgres data dir");
            let lock = tempfile::tempfile().expect("creating postgres lock file");
            let cluster = build_pg_cluster(datadir.path());
            let socket_dir = datadir.path().to_str().expect("non-utf8 temporary dir").to_owned();
            postgresfixture::coordinate::run_and_destroy(&cluster, lock.into(), || {
                cluster.createdb("test_db").expect("creating test_db");
                let runtime = AssertUnwindSafe(single_threaded_runtime());
                let pool = AssertUnwindSafe(runtime.block_on(open_test_db(&socket_dir)));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |input| {
                        let input_dbg = format!("{input:?}");
                        let idle_before = pool.num_idle();
                        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            runtime.block_on(async {
                                $fn(pool.clone(), input).await;
                                idle_after_release(&pool, idle_before).await
                            })
                        }));
                        runtime
                            .block_on(sqlx::query(include_str!("../reset-test-db.sql")).execute(pool.inner()))
                            .expect("resetting test_db");
                        let idle_after = outcome.unwrap_or_else(|e| std::panic::resume_unwind(e));
                        assert!(
                            idle_after >= idle_before,
                            "{} leaked connections ({idle_before} idle before, {idle_after} after) on {input_dbg}",
                            stringify!($name),
                        );
                    });
            })
            .expect("running the postgres cluster");
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, String, |header: String| async move {
    let req = match http::Request::get("/")
        .header(http::header::AUTHORIZATION, header)
        .body(())
    {
        Ok(req) => req,
        // not a valid header value in the first place
        Err(_) => return,
    };
    let (mut parts, ()) = req.into_parts();
    match PreAuth::from_request_parts(&mut parts, &()).await {
        Ok(_) | Err(Error::Api(ApiError::Unauthenticated)) => (),
        Err(e) => panic!("bearer parsing failed with {e}"),
    }
});

/// Pools the fuzzer can register users into, bypassing the external session issuer
#[async_trait]
trait TestPool: DbPool {
    async fn seed_user(&self, is_admin: bool) -> (UserId, AuthToken);
}

#[async_trait]
impl TestPool for MemDb {
    async fn seed_user(&self, is_admin: bool) -> (UserId, AuthToken) {
        let user = self.add_user(is_admin).await;
        (user, self.open_session(user).await)
    }
}

#[async_trait]
impl TestPool for db::PgPool {
    async fn seed_user(&self, is_admin: bool) -> (UserId, AuthToken) {
        let user = UserId(Uuid::new_v4());
        let token = AuthToken(Uuid::new_v4());
        sqlx::query("INSERT INTO users (id, name, is_admin) VALUES ($1, $2, $3)")
            .bind(user.0)
            .bind(user.0.to_string())
            .bind(is_admin)
            .execute(self.inner())
            .await
            .expect("inserting test user");
        sqlx::query("INSERT INTO sessions (id, user_id) VALUES ($1, $2)")
            .bind(token.0)
            .bind(user.0)
            .execute(self.inner())
            .await
            .expect("inserting test session");
        (user, token)
    }
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzScope {
    AllPosts,
    Community(bool),
    PostComments(usize),
    AuthoredBy(usize),
}

// `hot` is left out: app and mock can not share the same `now`
#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    AddUser {
        is_admin: bool,
    },
    Whoami {
        sid: usize,
    },
    CreatePost {
        sid: usize,
        as_user: Option<usize>,
        reuse_id: Option<usize>,
        age: u16,
        title: String,
        community: Option<bool>,
    },
    CreateComment {
        sid: usize,
        post: usize,
        parent: Option<usize>,
        parent_in_post: bool,
        self_parent: bool,
        reuse_id: Option<usize>,
        age: u16,
        content: String,
    },
    Vote {
        sid: usize,
        target: usize,
        value: i8,
    },
    SetDeleted {
        sid: usize,
        target: usize,
        deleted: bool,
    },
    ListComments {
        sid: Option<usize>,
        post: usize,
        top: Option<bool>,
    },
    ListVotables {
        sid: Option<usize>,
        scope: FuzzScope,
        top: bool,
        page: u8,
        page_size: u8,
    },
    Karma {
        uid: usize,
    },
    RecomputeKarma {
        sid: Option<usize>,
        uid: usize,
    },
}

/// Sends one JSON request through the router and decodes the answer the way a
/// client would
async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<AuthToken>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let mut req = http::Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        req = req.header(http::header::AUTHORIZATION, format!("bearer {}", token.0));
    }
    let req = req
        .body(Body::from(serde_json::to_vec(body).expect("serializing request")))
        .expect("building request");

    let resp = app
        .ready()
        .await
        .expect("router not ready")
        .call(req)
        .await
        .expect("router failed");
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("reading response body");
    if status != http::StatusCode::OK {
        return Err(ApiError::parse(&bytes)
            .unwrap_or_else(|e| panic!("undecodable error {bytes:?} for {body:?}: {e}")));
    }
    // `()` handlers answer with an empty body
    let bytes: &[u8] = match std::any::TypeId::of::<Resp>() == std::any::TypeId::of::<()>() {
        true => b"null",
        false => &bytes,
    };
    Ok(serde_json::from_slice(bytes)
        .unwrap_or_else(|e| panic!("undecodable answer {bytes:?} for {body:?}: {e}")))
}

fn compare<T: Debug + PartialEq>(what: &str, app: Result<T, ApiError>, mock: Result<T, ApiError>) {
    assert_eq!(app, mock, "{what}: app (left) and mock (right) disagree");
}

/// Maps an arbitrary fuzzer-provided index onto `0..len`
fn pick(fuzz_id: usize, len: usize) -> Option<usize> {
    (len > 0).then(|| ((fuzz_id as u128 * len as u128) >> usize::BITS) as usize)
}

/// Whole seconds, so that dates survive the database round-trip unchanged
fn date(age: u16) -> Time {
    chrono::Utc.timestamp_opt(1_670_000_000 - i64::from(age), 0).unwrap()
}

struct ComparativeFuzzer<P> {
    admin_token: AuthToken,
    app: Router,
    karma: KarmaQueue,
    pool: P,
    mock: MockServer,
    sessions: Vec<AuthToken>,
}

impl<P: TestPool> ComparativeFuzzer<P> {
    fn new(pool: P) -> ComparativeFuzzer<P> {
        let admin_token = AuthToken(Uuid::new_v4());
        let (karma, _) = KarmaQueue::spawn(pool.clone(), KarmaConfig::default());
        let app = app(AppState {
            pool: pool.clone(),
            karma: karma.clone(),
            admin_token: Some(admin_token),
            policy: VotePolicy::default(),
        });
        ComparativeFuzzer {
            admin_token,
            app,
            karma,
            pool,
            mock: MockServer::new(Some(admin_token)),
            sessions: Vec::new(),
        }
    }

    fn session(&self, sid: usize) -> Option<AuthToken> {
        pick(sid, self.sessions.len()).map(|s| self.sessions[s])
    }

    fn votable(&self, target: usize) -> Option<VotableId> {
        pick(target, self.mock.test_num_votables()).map(|v| self.mock.test_get_votable(v))
    }

    fn user(&self, uid: usize) -> UserId {
        pick(uid, self.mock.test_num_users())
            .map(|u| self.mock.test_get_user(u))
            .unwrap_or_else(UserId::stub)
    }

    fn post(&self, post: usize) -> PostId {
        let posts = self.mock.test_posts();
        pick(post, posts.len())
            .map(|p| posts[p])
            .unwrap_or_else(PostId::stub)
    }

    fn fresh_uuid(&self, reuse_id: Option<usize>) -> Uuid {
        reuse_id
            .and_then(|r| self.votable(r))
            .map(|v| v.uuid())
            .unwrap_or_else(Uuid::new_v4)
    }

    #[async_recursion]
    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        let sid = match &op {
            FuzzOp::AddUser { .. } => None,
            FuzzOp::Whoami { sid }
            | FuzzOp::CreatePost { sid, .. }
            | FuzzOp::CreateComment { sid, .. }
            | FuzzOp::Vote { sid, .. }
            | FuzzOp::SetDeleted { sid, .. } => Some(*sid),
            FuzzOp::ListComments { .. }
            | FuzzOp::ListVotables { .. }
            | FuzzOp::Karma { .. }
            | FuzzOp::RecomputeKarma { .. } => None,
        };
        if sid.is_some() && self.sessions.is_empty() {
            self.execute_fuzz_op(FuzzOp::AddUser { is_admin: false }).await;
        }
        let tok = sid.and_then(|s| self.session(s));
        match op {
            FuzzOp::AddUser { is_admin } => {
                let (user, token) = self.pool.seed_user(is_admin).await;
                self.mock.test_add_user(user, is_admin, token);
                self.sessions.push(token);
            }
            FuzzOp::Whoami { .. } => compare(
                "Whoami",
                run_on_app(&mut self.app, "GET", "/api/whoami", tok, &()).await,
                tok.ok_or(ApiError::Unauthenticated)
                    .and_then(|t| self.mock.whoami(t)),
            ),
            FuzzOp::CreatePost {
                as_user,
                reuse_id,
                age,
                title,
                community,
                ..
            } => {
                let tok = tok.expect("sessions were just filled");
                let author = match as_user {
                    Some(u) => self.user(u),
                    None => self.mock.whoami(tok).expect("session is valid").user,
                };
                let p = NewPost {
                    id: PostId(self.fresh_uuid(reuse_id)),
                    author,
                    date: date(age),
                    title,
                    content: String::from("content"),
                    community: community.map(|c| String::from(if c { "rust" } else { "go" })),
                };
                compare(
                    "CreatePost",
                    run_on_app(&mut self.app, "POST", "/api/post", Some(tok), &p).await,
                    self.mock.create_post(tok, p),
                )
            }
            FuzzOp::CreateComment {
                post,
                parent,
                parent_in_post,
                self_parent,
                reuse_id,
                age,
                content,
                ..
            } => {
                let tok = tok.expect("sessions were just filled");
                let id = CommentId(self.fresh_uuid(reuse_id));
                let post = self.post(post);
                let parent = match (self_parent, parent) {
                    (true, _) => Some(id),
                    (false, None) => None,
                    // an existing comment of the same post
                    (false, Some(p)) if parent_in_post => {
                        let siblings = self.mock.test_comments_of(post);
                        Some(
                            pick(p, siblings.len())
                                .map(|i| siblings[i])
                                .unwrap_or_else(CommentId::stub),
                        )
                    }
                    (false, Some(p)) => Some(
                        self.votable(p)
                            .map(|v| CommentId(v.uuid()))
                            .unwrap_or_else(CommentId::stub),
                    ),
                };
                let c = NewComment {
                    id,
                    post,
                    parent,
                    author: self.mock.whoami(tok).expect("session is valid").user,
                    date: date(age),
                    content,
                };
                compare(
                    "CreateComment",
                    run_on_app(&mut self.app, "POST", "/api/comment", Some(tok), &c).await,
                    self.mock.create_comment(tok, c),
                )
            }
            FuzzOp::Vote { target, value, .. } => {
                let tok = tok.expect("sessions were just filled");
                let v = CastVote {
                    votable: self
                        .votable(target)
                        .unwrap_or(VotableId::Post(PostId::stub())),
                    value: i64::from(value),
                };
                compare::<VoteResult>(
                    "Vote",
                    run_on_app(&mut self.app, "POST", "/api/vote", Some(tok), &v).await,
                    self.mock.vote(tok, v),
                )
            }
            FuzzOp::SetDeleted {
                target, deleted, ..
            } => {
                let tok = tok.expect("sessions were just filled");
                let d = SetDeleted {
                    votable: self
                        .votable(target)
                        .unwrap_or(VotableId::Comment(CommentId::stub())),
                    deleted,
                };
                compare(
                    "SetDeleted",
                    run_on_app(&mut self.app, "POST", "/api/delete", Some(tok), &d).await,
                    self.mock.set_deleted(tok, d),
                )
            }
            FuzzOp::ListComments { sid, post, top } => {
                let tok = sid.and_then(|s| self.session(s));
                let req = ListComments {
                    post: self.post(post),
                    ranking: top.map(|t| if t { Ranking::Top } else { Ranking::New }),
                };
                compare::<Vec<CommentNode>>(
                    "ListComments",
                    run_on_app(&mut self.app, "POST", "/api/comments", tok, &req).await,
                    self.mock.list_comments(tok, req, chrono::Utc::now()),
                )
            }
            FuzzOp::ListVotables {
                sid,
                scope,
                top,
                page,
                page_size,
            } => {
                let tok = sid.and_then(|s| self.session(s));
                let scope = match scope {
                    FuzzScope::AllPosts => Scope::AllPosts,
                    FuzzScope::Community(c) => {
                        Scope::Community(String::from(if c { "rust" } else { "go" }))
                    }
                    FuzzScope::PostComments(p) => Scope::PostComments(self.post(p)),
                    FuzzScope::AuthoredBy(u) => Scope::AuthoredBy(self.user(u)),
                };
                let req = ListVotables {
                    scope,
                    ranking: if top { Ranking::Top } else { Ranking::New },
                    page: usize::from(page % 8),
                    page_size: usize::from(page_size),
                };
                compare::<Vec<RankedVotable>>(
                    "ListVotables",
                    run_on_app(&mut self.app, "POST", "/api/votables", tok, &req).await,
                    self.mock.list_votables(tok, req, chrono::Utc::now()),
                )
            }
            FuzzOp::Karma { uid } => {
                let user = self.user(uid);
                self.karma.flush().await.expect("flushing karma queue");
                compare::<i64>(
                    "Karma",
                    run_on_app(
                        &mut self.app,
                        "GET",
                        &format!("/api/users/{}/karma", user.0),
                        None,
                        &(),
                    )
                    .await,
                    self.mock.karma(user),
                )
            }
            FuzzOp::RecomputeKarma { sid, uid } => {
                let user = self.user(uid);
                let tok = match sid {
                    None => self.admin_token,
                    Some(s) => match self.session(s) {
                        Some(t) => t,
                        None => self.admin_token,
                    },
                };
                compare::<i64>(
                    "RecomputeKarma",
                    run_on_app(
                        &mut self.app,
                        "POST",
                        &format!("/api/admin/recompute-karma/{}", user.0),
                        Some(tok),
                        &(),
                    )
                    .await,
                    self.mock.admin_recompute_karma(tok, user),
                )
            }
        }
    }
}

do_tokio_test!(compare_with_mock_in_memory, Vec<FuzzOp>, |test: Vec<FuzzOp>| async move {
    let mut fuzzer = ComparativeFuzzer::new(MemDb::new());
    for op in test {
        fuzzer.execute_fuzz_op(op).await;
    }
});

#[tokio::test]
async fn reply_chains_match_mock() {
    let mut fuzzer = ComparativeFuzzer::new(MemDb::new());
    let comment = |parent| FuzzOp::CreateComment {
        sid: 0,
        post: 0,
        parent,
        parent_in_post: true,
        self_parent: false,
        reuse_id: None,
        age: 10,
        content: String::from("reply"),
    };
    fuzzer.execute_fuzz_op(FuzzOp::AddUser { is_admin: false }).await;
    fuzzer
        .execute_fuzz_op(FuzzOp::CreatePost {
            sid: 0,
            as_user: None,
            reuse_id: None,
            age: 20,
            title: String::from("title"),
            community: None,
        })
        .await;
    fuzzer.execute_fuzz_op(comment(None)).await;
    // the newest comment of the post is always the last one, so this builds a chain
    fuzzer.execute_fuzz_op(comment(Some(usize::MAX))).await;
    fuzzer.execute_fuzz_op(comment(Some(usize::MAX))).await;
    fuzzer
        .execute_fuzz_op(FuzzOp::ListComments {
            sid: None,
            post: 0,
            top: None,
        })
        .await;

    let post = fuzzer.mock.test_posts()[0];
    assert_eq!(fuzzer.mock.test_comments_of(post).len(), 3);
    let tree = fuzzer
        .mock
        .list_comments(None, ListComments { post, ranking: None }, chrono::Utc::now())
        .unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].count(), 3);
    assert_eq!(tree[0].children[0].children.len(), 1);
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool);
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);
