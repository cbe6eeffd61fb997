use crate::{
    api::{UserId, Votable, Vote, VoteSet},
    Error,
};

/// Effect of a single cast on a vote set
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VoteChange {
    pub previous: Option<Vote>,
    pub current: Option<Vote>,
}

impl VoteChange {
    pub fn is_noop(&self) -> bool {
        self.previous == self.current
    }

    /// How much the score moves because of this change
    pub fn delta(&self) -> i64 {
        Vote::value_of(self.current) - Vote::value_of(self.previous)
    }
}

pub trait VoteLedger {
    /// Sets (or with `None`, retracts) the vote of `voter`
    fn cast(&mut self, voter: UserId, vote: Option<Vote>) -> VoteChange;
}

impl VoteLedger for VoteSet {
    fn cast(&mut self, voter: UserId, vote: Option<Vote>) -> VoteChange {
        let previous = match vote {
            Some(v) => self.0.insert(voter, v),
            None => self.0.remove(&voter),
        };
        VoteChange {
            previous,
            current: vote,
        }
    }
}

/// Applies a wire-level vote `value` (-1, 0 or 1) of `voter` on `votable`
///
/// Only touches the vote set: the cached score must be recomputed by the caller
/// before the votable gets stored.
pub fn cast_vote(votable: &mut Votable, voter: UserId, value: i64) -> Result<VoteChange, Error> {
    let vote = Vote::from_value(value)?;
    if votable.deleted {
        return Err(Error::not_found(votable.id.uuid()));
    }
    Ok(votable.votes.cast(voter, vote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{Error as ApiError, PostId, Uuid, VotableId},
        AggregateCounter,
    };

    fn votable() -> Votable {
        Votable::new(
            VotableId::Post(PostId(Uuid::new_v4())),
            UserId(Uuid::new_v4()),
            chrono::Utc::now(),
        )
    }

    #[test]
    fn insert_overwrite_retract() {
        let mut v = votable();
        let alice = UserId(Uuid::new_v4());

        let c = cast_vote(&mut v, alice, 1).unwrap();
        assert_eq!((c.previous, c.current, c.delta()), (None, Some(Vote::Up), 1));
        assert_eq!(v.vote_of(&alice), Some(Vote::Up));

        let c = cast_vote(&mut v, alice, -1).unwrap();
        assert_eq!(c.delta(), -2);
        assert_eq!(v.votes.len(), 1);

        let c = cast_vote(&mut v, alice, 0).unwrap();
        assert_eq!((c.previous, c.current, c.delta()), (Some(Vote::Down), None, 1));
        assert!(v.votes.is_empty());

        // retracting a vote that does not exist is a no-op
        let c = cast_vote(&mut v, alice, 0).unwrap();
        assert!(c.is_noop());
        assert!(v.votes.is_empty());
    }

    #[test]
    fn same_value_twice_is_idempotent() {
        let mut v = votable();
        let bob = UserId(Uuid::new_v4());
        cast_vote(&mut v, bob, -1).unwrap();
        v.recompute();
        let (votes, score) = (v.votes.clone(), v.score);

        let c = cast_vote(&mut v, bob, -1).unwrap();
        v.recompute();
        assert!(c.is_noop());
        assert_eq!(v.votes, votes);
        assert_eq!(v.score, score);
    }

    #[test]
    fn retract_removes_exactly_that_vote() {
        let mut v = votable();
        let voters = (0..4).map(|_| UserId(Uuid::new_v4())).collect::<Vec<_>>();
        for (i, u) in voters.iter().enumerate() {
            cast_vote(&mut v, *u, if i % 2 == 0 { 1 } else { -1 }).unwrap();
        }
        v.recompute();
        let before = v.score;

        cast_vote(&mut v, voters[1], 0).unwrap();
        v.recompute();
        assert_eq!(v.score, before + 1);
        assert_eq!(v.votes.len(), 3);
        assert_eq!(v.vote_of(&voters[0]), Some(Vote::Up));
        assert_eq!(v.vote_of(&voters[1]), None);
    }

    #[test]
    fn invalid_values_and_deleted_votables() {
        let mut v = votable();
        let u = UserId(Uuid::new_v4());
        assert!(matches!(
            cast_vote(&mut v, u, 2),
            Err(Error::Api(ApiError::InvalidValue(2)))
        ));
        assert!(v.votes.is_empty());

        v.deleted = true;
        assert!(matches!(
            cast_vote(&mut v, u, 1),
            Err(Error::Api(ApiError::NotFound(id))) if id == v.id.uuid()
        ));
        // value is checked first
        assert!(matches!(
            cast_vote(&mut v, u, -3),
            Err(Error::Api(ApiError::InvalidValue(-3)))
        ));
    }

    #[test]
    fn score_is_the_sum_after_any_sequence() {
        bolero::check!()
            .with_type::<Vec<(u8, i8)>>()
            .for_each(|ops| {
                let voters = (0..8).map(|i| UserId(Uuid::from_u128(i))).collect::<Vec<_>>();
                let mut v = votable();
                for (voter, value) in ops {
                    let voter = voters[*voter as usize % voters.len()];
                    let value = (*value as i64).rem_euclid(3) - 1;
                    let change = cast_vote(&mut v, voter, value).unwrap();
                    let before = v.score;
                    v.recompute();
                    assert_eq!(v.score, before + change.delta());
                    assert_eq!(v.score, v.votes.iter().map(|(_, v)| v.value()).sum::<i64>());
                    assert!(v.score_is_consistent());
                }
            });
    }
}
