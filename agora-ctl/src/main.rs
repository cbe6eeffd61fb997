use agora_api::{AuthToken, CommentNode, ListComments, PostId, Ranking, UserId, Uuid};
use anyhow::Context;

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long)]
    host: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Recompute the karma of a user right away
    RecomputeKarma {
        user: Uuid,
    },

    /// Show the stored karma of a user
    Karma {
        user: Uuid,
    },

    /// Print the comment tree of a post
    Thread {
        post: Uuid,

        /// One of new, top or hot
        #[structopt(long, default_value = "top", parse(try_from_str = parse_ranking))]
        ranking: Ranking,
    },
}

fn parse_ranking(s: &str) -> anyhow::Result<Ranking> {
    match s {
        "new" => Ok(Ranking::New),
        "top" => Ok(Ranking::Top),
        "hot" => Ok(Ranking::Hot),
        _ => Err(anyhow::anyhow!("unknown ranking {s:?}, expected new, top or hot")),
    }
}

fn admin_token() -> anyhow::Result<AuthToken> {
    let tok =
        std::env::var("ADMIN_TOKEN").context("retrieving ADMIN_TOKEN environment variable")?;
    let tok = Uuid::try_parse(&tok).context("parsing ADMIN_TOKEN as an auth token")?;
    Ok(AuthToken(tok))
}

fn print_thread(roots: &[CommentNode]) {
    let mut stack = roots.iter().rev().map(|n| (0, n)).collect::<Vec<_>>();
    while let Some((depth, n)) = stack.pop() {
        let who = match n.author {
            Some(a) => a.0.to_string(),
            None => String::from("[deleted]"),
        };
        println!(
            "{:indent$}{:+} {who}: {}",
            "",
            n.score,
            n.content.as_deref().unwrap_or("[deleted]"),
            indent = 2 * depth
        );
        stack.extend(n.children.iter().rev().map(|c| (depth + 1, c)));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = <Opt as structopt::StructOpt>::from_args();

    let client = reqwest::Client::new();

    match opt.cmd {
        Command::RecomputeKarma { user } => {
            let karma = client
                .post(format!("{}/api/admin/recompute-karma/{}", opt.host, user))
                .bearer_auth(admin_token()?.0)
                .send()
                .await?
                .error_for_status()?
                .json::<i64>()
                .await
                .context("parsing karma")?;
            println!("{:?}: {karma}", UserId(user));
        }
        Command::Karma { user } => {
            let karma = client
                .get(format!("{}/api/users/{}/karma", opt.host, user))
                .send()
                .await?
                .error_for_status()?
                .json::<i64>()
                .await
                .context("parsing karma")?;
            println!("{karma}");
        }
        Command::Thread { post, ranking } => {
            let tree = client
                .post(format!("{}/api/comments", opt.host))
                .json(&ListComments {
                    post: PostId(post),
                    ranking: Some(ranking),
                })
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<CommentNode>>()
                .await
                .context("parsing comment tree")?;
            print_thread(&tree);
        }
    }

    Ok(())
}
