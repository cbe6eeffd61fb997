use std::collections::HashSet;

use chrono::{Duration, Utc};
use rand::{seq::SliceRandom, Rng};
use uuid::Uuid;

const NUM_USERS: usize = 10;
const NUM_ADMINS: usize = 1;

const NUM_POSTS: usize = 40;
const POST_TITLE_LEN: usize = 8;
const POST_CONTENT_LEN: usize = 60;
const COMMUNITIES: &[&str] = &["rust", "databases", "offtopic"];

const NUM_COMMENTS: usize = 400;
const COMMENT_LEN: usize = 25;

/// Probability that a comment replies to an earlier comment of the same post
const REPLY_RATIO: f64 = 0.7;
const DELETED_RATIO: f64 = 0.05;

const NUM_VOTES: usize = 2000;
const MAX_AGE_MINUTES: i64 = 60 * 24 * 30;

fn gen_n_items(table: &str, n: usize, mut f: impl FnMut(usize) -> String) {
    if n == 0 {
        return;
    }
    println!("INSERT INTO {} VALUES", table);
    for i in 0..n {
        if i != 0 {
            println!(",");
        }
        print!("    {}", f(i));
    }
    println!();
    println!("ON CONFLICT DO NOTHING;");
}

fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

fn gen_date(rng: &mut impl Rng) -> String {
    let date = Utc::now() - Duration::minutes(rng.gen_range(0..MAX_AGE_MINUTES));
    date.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string()
}

struct Votable {
    id: Uuid,
    kind: &'static str,
    author: Uuid,
    date: String,
    deleted: bool,
}

fn main() {
    let mut rng = rand::thread_rng();

    // Users, the first ones being admins, each with one session
    let users = (0..NUM_USERS).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
    gen_n_items("users", NUM_USERS, |i| {
        format!(
            "('{}', '{}', {}, 0)",
            users[i],
            escape(&lipsum::lipsum_words(1).to_lowercase()).replace('.', "") + &i.to_string(),
            i < NUM_ADMINS,
        )
    });
    gen_n_items("sessions", NUM_USERS, |i| {
        let token = Uuid::new_v4();
        eprintln!("session token for user {}: {}", users[i], token);
        format!("('{}', '{}', now())", token, users[i])
    });

    // Posts
    let mut votables = Vec::new();
    let mut posts = Vec::new();
    for _ in 0..NUM_POSTS {
        let v = Votable {
            id: Uuid::new_v4(),
            kind: "post",
            author: *users.choose(&mut rng).expect("no users"),
            date: gen_date(&mut rng),
            deleted: rng.gen_bool(DELETED_RATIO),
        };
        posts.push((v.id, Vec::<Uuid>::new()));
        votables.push(v);
    }

    // Comments, replying only to earlier comments of the same post so that
    // every thread is a tree
    let mut comments = Vec::new();
    for _ in 0..NUM_COMMENTS {
        let post = rng.gen_range(0..posts.len());
        let (post_id, earlier) = &mut posts[post];
        let parent = match earlier.is_empty() || !rng.gen_bool(REPLY_RATIO) {
            true => None,
            false => earlier.choose(&mut rng).copied(),
        };
        let v = Votable {
            id: Uuid::new_v4(),
            kind: "comment",
            author: *users.choose(&mut rng).expect("no users"),
            date: gen_date(&mut rng),
            deleted: rng.gen_bool(DELETED_RATIO),
        };
        earlier.push(v.id);
        comments.push((v.id, *post_id, parent));
        votables.push(v);
    }

    gen_n_items("votables", votables.len(), |i| {
        let v = &votables[i];
        format!(
            "('{}', '{}', '{}', '{}', {}, 0, 0)",
            v.id, v.kind, v.author, v.date, v.deleted
        )
    });
    gen_n_items("posts", posts.len(), |i| {
        format!(
            "('{}', '{}', '{}', {})",
            posts[i].0,
            escape(&lipsum::lipsum_words(POST_TITLE_LEN)),
            escape(&lipsum::lipsum(POST_CONTENT_LEN)),
            match rng.gen_bool(0.8) {
                true => format!("'{}'", COMMUNITIES[i % COMMUNITIES.len()]),
                false => String::from("NULL"),
            },
        )
    });
    gen_n_items("comments", comments.len(), |i| {
        let (id, post, parent) = comments[i];
        format!(
            "('{}', '{}', {}, '{}')",
            id,
            post,
            match parent {
                Some(p) => format!("'{}'", p),
                None => String::from("NULL"),
            },
            escape(&lipsum::lipsum_words(COMMENT_LEN)),
        )
    });

    // Votes, at most one per voter and votable
    let mut seen = HashSet::new();
    let mut votes = Vec::new();
    for _ in 0..NUM_VOTES {
        let votable = votables.choose(&mut rng).expect("no votables").id;
        let voter = *users.choose(&mut rng).expect("no users");
        if seen.insert((votable, voter)) {
            let value = if rng.gen_bool(0.75) { 1 } else { -1 };
            votes.push((votable, voter, value));
        }
    }
    gen_n_items("votes", votes.len(), |i| {
        let (votable, voter, value) = votes[i];
        format!("('{}', '{}', {})", votable, voter, value)
    });

    // Cached aggregates, as the server would have computed them
    println!(
        "UPDATE votables v SET score = COALESCE((SELECT SUM(value) FROM votes WHERE votable_id = v.id), 0);"
    );
    println!(
        "UPDATE users u SET karma = COALESCE((SELECT SUM(score) FROM votables WHERE author_id = u.id AND NOT deleted), 0);"
    );
}
