use std::collections::HashMap;

use agora_api::{
    Actor, AuthToken, AuthoredScore, CommentId, Db, DbPool, NewComment, NewPost, PostId, Scope,
    Stored, StoredComment, StoredPost, UserId, Uuid, Votable, VotableId, Vote, VoteSet,
};
use anyhow::Context;
use axum::async_trait;
use chrono::TimeZone;
use futures::TryStreamExt;
use sqlx::{postgres::PgRow, Connection, Row};

#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub fn inner(&self) -> &sqlx::PgPool {
        &self.0
    }

    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }
}

#[async_trait]
impl DbPool for PgPool {
    type Conn = PgConn;

    async fn acquire(&self) -> anyhow::Result<PgConn> {
        Ok(PgConn(self.0.acquire().await?))
    }
}

pub struct PgConn(sqlx::pool::PoolConnection<sqlx::Postgres>);

const VOTABLE_COLUMNS: &str = "v.id, v.kind, v.author_id, v.date, v.deleted, v.score, v.revision";

fn votable_id(kind: &str, id: Uuid) -> anyhow::Result<VotableId> {
    match kind {
        "post" => Ok(VotableId::Post(PostId(id))),
        "comment" => Ok(VotableId::Comment(CommentId(id))),
        _ => Err(anyhow::anyhow!("votable {id} has unknown kind {kind:?}")),
    }
}

fn kind_of(id: VotableId) -> &'static str {
    match id {
        VotableId::Post(_) => "post",
        VotableId::Comment(_) => "comment",
    }
}

/// Parses the `VOTABLE_COLUMNS` of a row, leaving the vote set empty
fn votable_from_row(row: &PgRow) -> anyhow::Result<Votable> {
    let id = row.try_get("id").context("retrieving the id field")?;
    let kind = row
        .try_get::<String, _>("kind")
        .context("retrieving the kind field")?;
    Ok(Votable {
        id: votable_id(&kind, id)?,
        author: UserId(
            row.try_get("author_id")
                .context("retrieving the author_id field")?,
        ),
        date: chrono::Utc.from_utc_datetime(
            &row.try_get::<chrono::NaiveDateTime, _>("date")
                .context("retrieving the date field")?,
        ),
        deleted: row.try_get("deleted").context("retrieving the deleted field")?,
        votes: VoteSet::new(),
        score: row.try_get("score").context("retrieving the score field")?,
        revision: row
            .try_get("revision")
            .context("retrieving the revision field")?,
    })
}

fn post_from_row(row: &PgRow) -> anyhow::Result<StoredPost> {
    Ok(StoredPost {
        votable: votable_from_row(row)?,
        title: row.try_get("title").context("retrieving the title field")?,
        content: row.try_get("content").context("retrieving the content field")?,
        community: row
            .try_get("community")
            .context("retrieving the community field")?,
    })
}

fn comment_from_row(row: &PgRow) -> anyhow::Result<StoredComment> {
    Ok(StoredComment {
        votable: votable_from_row(row)?,
        post: PostId(row.try_get("post_id").context("retrieving the post_id field")?),
        parent: row
            .try_get::<Option<Uuid>, _>("parent_id")
            .context("retrieving the parent_id field")?
            .map(CommentId),
        content: row.try_get("content").context("retrieving the content field")?,
    })
}

impl PgConn {
    async fn load_votes(&mut self, ids: &[Uuid]) -> anyhow::Result<HashMap<Uuid, VoteSet>> {
        let mut res = HashMap::<Uuid, VoteSet>::new();
        let mut rows = sqlx::query(
            "SELECT votable_id, voter_id, value FROM votes WHERE votable_id = ANY($1)",
        )
        .bind(ids)
        .fetch(&mut *self.0);
        while let Some(row) = rows.try_next().await.context("querying votes table")? {
            let value = row
                .try_get::<i16, _>("value")
                .context("retrieving the value field")?;
            let vote = Vote::from_value(i64::from(value))
                .ok()
                .flatten()
                .ok_or_else(|| anyhow::anyhow!("votes table holds invalid value {value}"))?;
            res.entry(row.try_get("votable_id").context("retrieving the votable_id field")?)
                .or_default()
                .0
                .insert(
                    UserId(row.try_get("voter_id").context("retrieving the voter_id field")?),
                    vote,
                );
        }
        Ok(res)
    }

    /// Fills in the vote sets of freshly loaded votables
    async fn with_votes<T, F>(&mut self, mut items: Vec<T>, votable: F) -> anyhow::Result<Vec<T>>
    where
        T: Send,
        F: Send + Fn(&mut T) -> &mut Votable,
    {
        let ids = items
            .iter_mut()
            .map(|i| votable(i).id.uuid())
            .collect::<Vec<_>>();
        let mut votes = self.load_votes(&ids).await?;
        for i in items.iter_mut() {
            let v = votable(i);
            if let Some(set) = votes.remove(&v.id.uuid()) {
                v.votes = set;
            }
        }
        Ok(items)
    }

    async fn load_posts(
        &mut self,
        community: Option<&str>,
        author: Option<UserId>,
    ) -> anyhow::Result<Vec<StoredPost>> {
        let posts = sqlx::query(&format!(
            "
                SELECT {VOTABLE_COLUMNS}, p.title, p.content, p.community
                    FROM posts p
                INNER JOIN votables v
                    ON v.id = p.id
                WHERE NOT v.deleted
                AND ($1::TEXT IS NULL OR p.community = $1)
                AND ($2::UUID IS NULL OR v.author_id = $2)
            "
        ))
        .bind(community)
        .bind(author.map(|a| a.0))
        .fetch_all(&mut *self.0)
        .await
        .context("querying posts table")?
        .iter()
        .map(post_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;
        self.with_votes(posts, |p| &mut p.votable).await
    }

    async fn load_comments(
        &mut self,
        post: Option<PostId>,
        author: Option<UserId>,
        include_deleted: bool,
    ) -> anyhow::Result<Vec<StoredComment>> {
        let comments = sqlx::query(&format!(
            "
                SELECT {VOTABLE_COLUMNS}, c.post_id, c.parent_id, c.content
                    FROM comments c
                INNER JOIN votables v
                    ON v.id = c.id
                WHERE ($1 OR NOT v.deleted)
                AND ($2::UUID IS NULL OR c.post_id = $2)
                AND ($3::UUID IS NULL OR v.author_id = $3)
            "
        ))
        .bind(include_deleted)
        .bind(post.map(|p| p.0))
        .bind(author.map(|a| a.0))
        .fetch_all(&mut *self.0)
        .await
        .context("querying comments table")?
        .iter()
        .map(comment_from_row)
        .collect::<anyhow::Result<Vec<_>>>()?;
        self.with_votes(comments, |c| &mut c.votable).await
    }

    /// Inserts the votable row of new content, returning false if the id is taken
    async fn insert_votable(
        conn: &mut sqlx::PgConnection,
        id: VotableId,
        author: UserId,
        date: chrono::DateTime<chrono::Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            "
                INSERT INTO votables (id, kind, author_id, date, deleted, score, revision)
                VALUES ($1, $2, $3, $4, false, 0, 0)
                ON CONFLICT DO NOTHING
            ",
        )
        .bind(id.uuid())
        .bind(kind_of(id))
        .bind(author.0)
        .bind(date.naive_utc())
        .execute(conn)
        .await
        .with_context(|| format!("inserting votable {:?}", id))?;
        Ok(res.rows_affected() == 1)
    }
}

#[async_trait]
impl Db for PgConn {
    async fn recover_session(&mut self, token: AuthToken) -> anyhow::Result<Option<Actor>> {
        sqlx::query(
            "
                SELECT u.id, u.is_admin
                    FROM sessions s
                INNER JOIN users u
                    ON u.id = s.user_id
                WHERE s.id = $1
            ",
        )
        .bind(token.0)
        .fetch_optional(&mut *self.0)
        .await
        .context("querying sessions table")?
        .map(|row| -> anyhow::Result<Actor> {
            Ok(Actor {
                user: UserId(row.try_get("id").context("retrieving the id field")?),
                is_admin: row
                    .try_get("is_admin")
                    .context("retrieving the is_admin field")?,
            })
        })
        .transpose()
    }

    async fn create_post(&mut self, p: &NewPost) -> anyhow::Result<bool> {
        let mut tx = self.0.begin().await.context("starting transaction")?;
        if !PgConn::insert_votable(&mut tx, VotableId::Post(p.id), p.author, p.date).await? {
            return Ok(false);
        }
        sqlx::query("INSERT INTO posts (id, title, content, community) VALUES ($1, $2, $3, $4)")
            .bind(p.id.0)
            .bind(&p.title)
            .bind(&p.content)
            .bind(&p.community)
            .execute(&mut tx)
            .await
            .with_context(|| format!("inserting post {:?}", p.id))?;
        tx.commit().await.context("committing transaction")?;
        Ok(true)
    }

    async fn create_comment(&mut self, c: &NewComment) -> anyhow::Result<bool> {
        let mut tx = self.0.begin().await.context("starting transaction")?;
        if !PgConn::insert_votable(&mut tx, VotableId::Comment(c.id), c.author, c.date).await? {
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO comments (id, post_id, parent_id, content) VALUES ($1, $2, $3, $4)",
        )
        .bind(c.id.0)
        .bind(c.post.0)
        .bind(c.parent.map(|p| p.0))
        .bind(&c.content)
        .execute(&mut tx)
        .await
        .with_context(|| format!("inserting comment {:?}", c.id))?;
        tx.commit().await.context("committing transaction")?;
        Ok(true)
    }

    async fn load_votable(&mut self, id: VotableId) -> anyhow::Result<Option<Votable>> {
        let row = sqlx::query(&format!(
            "SELECT {VOTABLE_COLUMNS} FROM votables v WHERE v.id = $1 AND v.kind = $2"
        ))
        .bind(id.uuid())
        .bind(kind_of(id))
        .fetch_optional(&mut *self.0)
        .await
        .context("querying votables table")?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        // votes are read after the revision, so a concurrent write in between
        // is caught when storing
        let votable = votable_from_row(&row)?;
        Ok(self
            .with_votes(vec![votable], |v| v)
            .await?
            .pop())
    }

    async fn store_votable(&mut self, v: &Votable, expected_revision: i64) -> anyhow::Result<bool> {
        let mut tx = self.0.begin().await.context("starting transaction")?;
        let res = sqlx::query(
            "
                UPDATE votables
                SET deleted = $2, score = $3, revision = $4
                WHERE id = $1 AND revision = $5
            ",
        )
        .bind(v.id.uuid())
        .bind(v.deleted)
        .bind(v.score)
        .bind(v.revision)
        .bind(expected_revision)
        .execute(&mut tx)
        .await
        .with_context(|| format!("updating votable {:?}", v.id))?;
        if res.rows_affected() != 1 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM votes WHERE votable_id = $1")
            .bind(v.id.uuid())
            .execute(&mut tx)
            .await
            .with_context(|| format!("clearing votes of {:?}", v.id))?;
        let (voters, values): (Vec<Uuid>, Vec<i16>) = v
            .votes
            .iter()
            .map(|(u, vote)| (u.0, vote.value() as i16))
            .unzip();
        sqlx::query(
            "
                INSERT INTO votes (votable_id, voter_id, value)
                SELECT $1, voter, value FROM UNNEST($2::UUID[], $3::SMALLINT[]) AS t(voter, value)
            ",
        )
        .bind(v.id.uuid())
        .bind(&voters)
        .bind(&values)
        .execute(&mut tx)
        .await
        .with_context(|| format!("inserting votes of {:?}", v.id))?;
        tx.commit().await.context("committing transaction")?;
        Ok(true)
    }

    async fn load_post(&mut self, id: PostId) -> anyhow::Result<Option<StoredPost>> {
        let row = sqlx::query(&format!(
            "
                SELECT {VOTABLE_COLUMNS}, p.title, p.content, p.community
                    FROM posts p
                INNER JOIN votables v
                    ON v.id = p.id
                WHERE p.id = $1
            "
        ))
        .bind(id.0)
        .fetch_optional(&mut *self.0)
        .await
        .context("querying posts table")?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        Ok(self
            .with_votes(vec![post_from_row(&row)?], |p| &mut p.votable)
            .await?
            .pop())
    }

    async fn load_comment(&mut self, id: CommentId) -> anyhow::Result<Option<StoredComment>> {
        let row = sqlx::query(&format!(
            "
                SELECT {VOTABLE_COLUMNS}, c.post_id, c.parent_id, c.content
                    FROM comments c
                INNER JOIN votables v
                    ON v.id = c.id
                WHERE c.id = $1
            "
        ))
        .bind(id.0)
        .fetch_optional(&mut *self.0)
        .await
        .context("querying comments table")?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        Ok(self
            .with_votes(vec![comment_from_row(&row)?], |c| &mut c.votable)
            .await?
            .pop())
    }

    async fn load_post_comments(&mut self, post: PostId) -> anyhow::Result<Vec<StoredComment>> {
        self.load_comments(Some(post), None, true).await
    }

    async fn load_scope(&mut self, scope: &Scope) -> anyhow::Result<Vec<Stored>> {
        Ok(match scope {
            Scope::AllPosts => self
                .load_posts(None, None)
                .await?
                .into_iter()
                .map(Stored::Post)
                .collect(),
            Scope::Community(c) => self
                .load_posts(Some(c), None)
                .await?
                .into_iter()
                .map(Stored::Post)
                .collect(),
            Scope::PostComments(p) => self
                .load_comments(Some(*p), None, false)
                .await?
                .into_iter()
                .map(Stored::Comment)
                .collect(),
            Scope::AuthoredBy(u) => {
                let posts = self.load_posts(None, Some(*u)).await?;
                let comments = self.load_comments(None, Some(*u), false).await?;
                posts
                    .into_iter()
                    .map(Stored::Post)
                    .chain(comments.into_iter().map(Stored::Comment))
                    .collect()
            }
        })
    }

    async fn load_authored(&mut self, user: UserId) -> anyhow::Result<Vec<AuthoredScore>> {
        sqlx::query("SELECT id, kind, score, deleted FROM votables WHERE author_id = $1")
            .bind(user.0)
            .fetch_all(&mut *self.0)
            .await
            .context("querying votables table")?
            .iter()
            .map(|row| -> anyhow::Result<AuthoredScore> {
                let kind = row
                    .try_get::<String, _>("kind")
                    .context("retrieving the kind field")?;
                Ok(AuthoredScore {
                    id: votable_id(&kind, row.try_get("id").context("retrieving the id field")?)?,
                    score: row.try_get("score").context("retrieving the score field")?,
                    deleted: row.try_get("deleted").context("retrieving the deleted field")?,
                })
            })
            .collect()
    }

    async fn load_karma(&mut self, user: UserId) -> anyhow::Result<Option<i64>> {
        sqlx::query("SELECT karma FROM users WHERE id = $1")
            .bind(user.0)
            .fetch_optional(&mut *self.0)
            .await
            .context("querying users table")?
            .map(|row| row.try_get("karma").context("retrieving the karma field"))
            .transpose()
    }

    async fn store_karma(&mut self, user: UserId, karma: i64) -> anyhow::Result<bool> {
        let res = sqlx::query("UPDATE users SET karma = $2 WHERE id = $1")
            .bind(user.0)
            .bind(karma)
            .execute(&mut *self.0)
            .await
            .with_context(|| format!("storing karma of {:?}", user))?;
        Ok(res.rows_affected() == 1)
    }
}
