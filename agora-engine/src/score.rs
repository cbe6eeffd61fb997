use crate::api::Votable;

/// Derives the cached score of a votable from its vote set
///
/// Scores are always re-summed from the whole vote set rather than patched with
/// deltas, so `score == sum(votes)` holds after every `recompute` whatever the
/// history of the votable.
pub trait AggregateCounter {
    fn recompute(&mut self) -> i64;

    fn score_is_consistent(&self) -> bool;
}

fn sum(v: &Votable) -> i64 {
    v.votes.iter().map(|(_, vote)| vote.value()).sum()
}

impl AggregateCounter for Votable {
    fn recompute(&mut self) -> i64 {
        self.score = sum(self);
        self.score
    }

    fn score_is_consistent(&self) -> bool {
        self.score == sum(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CommentId, UserId, Uuid, VotableId, Vote, VoteSet};

    #[test]
    fn untrusted_cache_is_overwritten() {
        let mut v = Votable::new(
            VotableId::Comment(CommentId::stub()),
            UserId::stub(),
            chrono::Utc::now(),
        );
        v.votes = VoteSet::from_iter([
            (UserId(Uuid::from_u128(1)), Vote::Up),
            (UserId(Uuid::from_u128(2)), Vote::Up),
            (UserId(Uuid::from_u128(3)), Vote::Down),
        ]);
        v.score = 42;
        assert!(!v.score_is_consistent());
        assert_eq!(v.recompute(), 1);
        assert_eq!(v.score, 1);
        assert!(v.score_is_consistent());
    }
}
