use chrono::Utc;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Largest page a client may request when listing votables
pub const MAX_PAGE_SIZE: usize = 100;

mod db;
pub use db::{AuthoredScore, Db, DbPool, Stored, StoredComment, StoredPost};

mod error;
pub use error::Error;

mod listing;
pub use listing::{ListVotables, RankedVotable, Ranking, Scope};

mod thread;
pub use thread::{CommentNode, ListComments};

mod user;
pub use user::{Actor, AuthToken, UserId};

mod votable;
pub use votable::{
    CastVote, CommentId, NewComment, NewPost, PostId, SetDeleted, Votable, VotableId, Vote,
    VoteResult, VoteSet,
};

// Postgres rejects null bytes in text columns, so they must be refused before
// reaching the database. Everything else is the sanitization collaborator's job.
pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_bytes_are_refused() {
        assert_eq!(validate_string("hello world"), Ok(()));
        assert_eq!(
            validate_string("hello\0world"),
            Err(Error::NullByteInString(String::from("hello\0world")))
        );
    }
}
