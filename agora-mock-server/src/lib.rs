//! Naive model of the whole HTTP surface, used as an oracle by the server's fuzzer
//!
//! Everything is recomputed from scratch on each call: scores, karma, trees.
//! Self-votes are always allowed.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
};

use agora_api::{
    Actor, AuthToken, CastVote, CommentId, CommentNode, Error, ListComments, ListVotables,
    NewComment, NewPost, PostId, RankedVotable, Ranking, Scope, SetDeleted, Time, UserId,
    VotableId, VoteResult,
};

struct Item {
    author: UserId,
    date: Time,
    deleted: bool,
    votes: BTreeMap<UserId, i64>,
    content: String,
    kind: Kind,
}

enum Kind {
    Post {
        title: String,
        community: Option<String>,
    },
    Comment {
        post: PostId,
        parent: Option<CommentId>,
    },
}

impl Item {
    fn score(&self) -> i64 {
        self.votes.values().sum()
    }
}

pub struct MockServer {
    admin_token: Option<AuthToken>,
    users: BTreeMap<UserId, bool>,
    sessions: HashMap<AuthToken, UserId>,
    items: BTreeMap<VotableId, Item>,

    /// Creation order, for the fuzzer to pick from
    created: Vec<VotableId>,
}

impl MockServer {
    pub fn new(admin_token: Option<AuthToken>) -> MockServer {
        MockServer {
            admin_token,
            users: BTreeMap::new(),
            sessions: HashMap::new(),
            items: BTreeMap::new(),
            created: Vec::new(),
        }
    }

    pub fn test_add_user(&mut self, user: UserId, is_admin: bool, token: AuthToken) {
        self.users.insert(user, is_admin);
        self.sessions.insert(token, user);
    }

    pub fn test_num_users(&self) -> usize {
        self.users.len()
    }

    pub fn test_get_user(&self, id: usize) -> UserId {
        *self
            .users
            .keys()
            .nth(id)
            .unwrap_or_else(|| panic!("getting user {id} among {}", self.users.len()))
    }

    /// Number of posts and comments ever created
    pub fn test_num_votables(&self) -> usize {
        self.created.len()
    }

    pub fn test_get_votable(&self, id: usize) -> VotableId {
        self.created[id]
    }

    pub fn test_posts(&self) -> Vec<PostId> {
        self.created
            .iter()
            .filter_map(|v| match v {
                VotableId::Post(p) => Some(*p),
                VotableId::Comment(_) => None,
            })
            .collect()
    }

    pub fn test_comments_of(&self, post: PostId) -> Vec<CommentId> {
        self.created
            .iter()
            .filter_map(|v| match (v, self.items.get(v).map(|i| &i.kind)) {
                (VotableId::Comment(c), Some(Kind::Comment { post: p, .. })) if *p == post => {
                    Some(*c)
                }
                _ => None,
            })
            .collect()
    }

    fn resolve(&self, tok: AuthToken) -> Result<Actor, Error> {
        let user = self.sessions.get(&tok).ok_or(Error::Unauthenticated)?;
        Ok(Actor {
            user: *user,
            is_admin: self.users[user],
        })
    }

    fn resolve_maybe(&self, tok: Option<AuthToken>) -> Result<Option<UserId>, Error> {
        tok.map(|t| self.resolve(t).map(|a| a.user)).transpose()
    }

    fn uuid_used(&self, id: agora_api::Uuid) -> bool {
        self.items.contains_key(&VotableId::Post(PostId(id)))
            || self.items.contains_key(&VotableId::Comment(CommentId(id)))
    }

    pub fn whoami(&self, tok: AuthToken) -> Result<Actor, Error> {
        self.resolve(tok)
    }

    pub fn create_post(&mut self, tok: AuthToken, p: NewPost) -> Result<(), Error> {
        let actor = self.resolve(tok)?;
        p.validate()?;
        if p.author != actor.user {
            return Err(Error::PermissionDenied);
        }
        if self.uuid_used(p.id.0) {
            return Err(Error::UuidAlreadyUsed(p.id.0));
        }
        let id = VotableId::Post(p.id);
        self.items.insert(
            id,
            Item {
                author: p.author,
                date: p.date,
                deleted: false,
                votes: BTreeMap::new(),
                content: p.content,
                kind: Kind::Post {
                    title: p.title,
                    community: p.community,
                },
            },
        );
        self.created.push(id);
        Ok(())
    }

    pub fn create_comment(&mut self, tok: AuthToken, c: NewComment) -> Result<(), Error> {
        let actor = self.resolve(tok)?;
        c.validate()?;
        if c.author != actor.user {
            return Err(Error::PermissionDenied);
        }
        match self.items.get(&VotableId::Post(c.post)) {
            Some(p) if !p.deleted => (),
            _ => return Err(Error::NotFound(c.post.0)),
        }
        if let Some(parent) = c.parent {
            if parent == c.id {
                return Err(Error::AcyclicViolation);
            }
            let parent_item = self
                .items
                .get(&VotableId::Comment(parent))
                .ok_or(Error::AcyclicViolation)?;
            match parent_item.kind {
                Kind::Comment { post, .. } if post == c.post => (),
                _ => return Err(Error::AcyclicViolation),
            }
            if parent_item.deleted {
                return Err(Error::NotFound(parent.0));
            }
        }
        if self.uuid_used(c.id.0) {
            return Err(Error::UuidAlreadyUsed(c.id.0));
        }
        let id = VotableId::Comment(c.id);
        self.items.insert(
            id,
            Item {
                author: c.author,
                date: c.date,
                deleted: false,
                votes: BTreeMap::new(),
                content: c.content,
                kind: Kind::Comment {
                    post: c.post,
                    parent: c.parent,
                },
            },
        );
        self.created.push(id);
        Ok(())
    }

    pub fn vote(&mut self, tok: AuthToken, v: CastVote) -> Result<VoteResult, Error> {
        let actor = self.resolve(tok)?;
        if !(-1..=1).contains(&v.value) {
            return Err(Error::InvalidValue(v.value));
        }
        let item = self
            .items
            .get_mut(&v.votable)
            .ok_or(Error::NotFound(v.votable.uuid()))?;
        if item.deleted {
            return Err(Error::NotFound(v.votable.uuid()));
        }
        if v.value == 0 {
            item.votes.remove(&actor.user);
        } else {
            item.votes.insert(actor.user, v.value);
        }
        Ok(VoteResult {
            score: item.score(),
            voter_value: v.value,
        })
    }

    pub fn set_deleted(&mut self, tok: AuthToken, d: SetDeleted) -> Result<(), Error> {
        let actor = self.resolve(tok)?;
        let item = self
            .items
            .get_mut(&d.votable)
            .ok_or(Error::NotFound(d.votable.uuid()))?;
        if !actor.is_admin && actor.user != item.author {
            return Err(Error::PermissionDenied);
        }
        item.deleted = d.deleted;
        Ok(())
    }

    pub fn karma(&self, user: UserId) -> Result<i64, Error> {
        if !self.users.contains_key(&user) {
            return Err(Error::NotFound(user.0));
        }
        Ok(self
            .items
            .values()
            .filter(|i| i.author == user && !i.deleted)
            .map(|i| i.score())
            .sum())
    }

    /// `tok` is either the admin token or the session of an admin user
    pub fn admin_recompute_karma(&self, tok: AuthToken, user: UserId) -> Result<i64, Error> {
        if Some(tok) != self.admin_token && !self.resolve(tok)?.is_admin {
            return Err(Error::PermissionDenied);
        }
        self.karma(user)
    }

    fn compare(&self, ranking: Ranking, now: Time, a: &VotableId, b: &VotableId) -> Ordering {
        let (ia, ib) = (&self.items[a], &self.items[b]);
        let hot = |i: &Item| {
            let age = (now - i.date).num_seconds().max(0) as f64 / 3600.0;
            i.score() as f64 / (age + 2.0).powf(1.8)
        };
        let primary = match ranking {
            Ranking::New => Ordering::Equal,
            Ranking::Top => ib.score().cmp(&ia.score()),
            Ranking::Hot => hot(ib).total_cmp(&hot(ia)),
        };
        primary
            .then(ib.date.cmp(&ia.date))
            .then(a.cmp(b))
    }

    fn node(
        &self,
        id: CommentId,
        post: PostId,
        viewer: Option<UserId>,
        ranking: Ranking,
        now: Time,
    ) -> Option<CommentNode> {
        let item = &self.items[&VotableId::Comment(id)];
        let children = self
            .children(Some(id), post, ranking, now)
            .into_iter()
            .filter_map(|c| self.node(c, post, viewer, ranking, now))
            .collect::<Vec<_>>();
        if item.deleted && children.is_empty() {
            return None;
        }
        Some(CommentNode {
            id,
            content: (!item.deleted).then(|| item.content.clone()),
            author: (!item.deleted).then_some(item.author),
            deleted: item.deleted,
            date: item.date,
            score: item.score(),
            viewer_vote: viewer.map(|v| item.votes.get(&v).copied().unwrap_or(0)),
            children,
        })
    }

    fn children(
        &self,
        parent: Option<CommentId>,
        post: PostId,
        ranking: Ranking,
        now: Time,
    ) -> Vec<CommentId> {
        let mut res = self
            .items
            .iter()
            .filter(|(_, i)| {
                matches!(i.kind, Kind::Comment { post: p, parent: par } if p == post && par == parent)
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        res.sort_by(|a, b| self.compare(ranking, now, a, b));
        res.into_iter()
            .filter_map(|id| match id {
                VotableId::Comment(c) => Some(c),
                VotableId::Post(_) => None,
            })
            .collect()
    }

    pub fn list_comments(
        &self,
        tok: Option<AuthToken>,
        req: ListComments,
        now: Time,
    ) -> Result<Vec<CommentNode>, Error> {
        let viewer = self.resolve_maybe(tok)?;
        if !self.items.contains_key(&VotableId::Post(req.post)) {
            return Err(Error::NotFound(req.post.0));
        }
        let ranking = req.ranking.unwrap_or_default();
        Ok(self
            .children(None, req.post, ranking, now)
            .into_iter()
            .filter_map(|c| self.node(c, req.post, viewer, ranking, now))
            .collect())
    }

    pub fn list_votables(
        &self,
        tok: Option<AuthToken>,
        req: ListVotables,
        now: Time,
    ) -> Result<Vec<RankedVotable>, Error> {
        let viewer = self.resolve_maybe(tok)?;
        req.validate()?;
        if let Scope::PostComments(p) = req.scope {
            match self.items.get(&VotableId::Post(p)) {
                Some(i) if !i.deleted => (),
                _ => return Err(Error::NotFound(p.0)),
            }
        }
        let mut ids = self
            .items
            .iter()
            .filter(|(_, i)| !i.deleted)
            .filter(|(_, i)| match (&req.scope, &i.kind) {
                (Scope::AllPosts, Kind::Post { .. }) => true,
                (Scope::Community(c), Kind::Post { community, .. }) => {
                    community.as_ref() == Some(c)
                }
                (Scope::PostComments(p), Kind::Comment { post, .. }) => post == p,
                (Scope::AuthoredBy(u), _) => i.author == *u,
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort_by(|a, b| self.compare(req.ranking, now, a, b));
        let page_size = req.page_size.clamp(1, agora_api::MAX_PAGE_SIZE);
        Ok(ids
            .into_iter()
            .skip(req.page.saturating_mul(page_size))
            .take(page_size)
            .map(|id| {
                let i = &self.items[&id];
                RankedVotable {
                    id,
                    author: i.author,
                    date: i.date,
                    score: i.score(),
                    title: match &i.kind {
                        Kind::Post { title, .. } => Some(title.clone()),
                        Kind::Comment { .. } => None,
                    },
                    content: i.content.clone(),
                    viewer_vote: viewer.map(|v| i.votes.get(&v).copied().unwrap_or(0)),
                }
            })
            .collect())
    }
}
