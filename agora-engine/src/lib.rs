mod content;
pub use content::{create_comment, create_post};

mod error;
pub use error::Error;

mod karma;
pub use karma::{recompute_karma, KarmaConfig, KarmaQueue};

mod ledger;
pub use ledger::{cast_vote, VoteChange, VoteLedger};

mod listing;
pub use listing::list_votables;

mod mem;
pub use mem::MemDb;

mod ranking;
pub use ranking::{Ranked, RankingExt, HOT_GRAVITY};

mod score;
pub use score::AggregateCounter;

mod thread;
pub use thread::{assemble_thread, build_tree};

mod vote;
pub use vote::{set_deleted, submit_vote, VotePolicy};

pub mod api {
    pub use agora_api::*;
}

