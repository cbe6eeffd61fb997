use std::cmp::Ordering;

use crate::api::{Ranking, Stored, StoredComment, StoredPost, Time, Votable};

/// Exponent of the age penalty of the `hot` ranking
pub const HOT_GRAVITY: f64 = 1.8;

pub trait Ranked {
    fn votable(&self) -> &Votable;
}

impl Ranked for Votable {
    fn votable(&self) -> &Votable {
        self
    }
}

impl Ranked for StoredPost {
    fn votable(&self) -> &Votable {
        &self.votable
    }
}

impl Ranked for StoredComment {
    fn votable(&self) -> &Votable {
        &self.votable
    }
}

impl Ranked for Stored {
    fn votable(&self) -> &Votable {
        Stored::votable(self)
    }
}

impl<T: Ranked> Ranked for &T {
    fn votable(&self) -> &Votable {
        (**self).votable()
    }
}

fn hotness(v: &Votable, now: Time) -> f64 {
    // content from the future is treated as brand new
    let age_hours = (now - v.date).num_seconds().max(0) as f64 / 3600.0;
    v.score as f64 / (age_hours + 2.0).powf(HOT_GRAVITY)
}

pub trait RankingExt {
    /// Total order, `Ordering::Less` meaning `a` is displayed before `b`
    fn compare(&self, a: &Votable, b: &Votable, now: Time) -> Ordering;

    fn sort<T: Ranked>(&self, items: &mut [T], now: Time);
}

impl RankingExt for Ranking {
    fn compare(&self, a: &Votable, b: &Votable, now: Time) -> Ordering {
        let primary = match self {
            Ranking::New => Ordering::Equal,
            Ranking::Top => b.score.cmp(&a.score),
            Ranking::Hot => hotness(b, now).total_cmp(&hotness(a, now)),
        };
        primary
            .then_with(|| b.date.cmp(&a.date))
            .then_with(|| a.id.cmp(&b.id))
    }

    fn sort<T: Ranked>(&self, items: &mut [T], now: Time) {
        items.sort_by(|a, b| self.compare(a.votable(), b.votable(), now))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::api::{PostId, UserId, Uuid, VotableId};

    fn at(id: u128, score: i64, date: Time) -> Votable {
        let mut v = Votable::new(VotableId::Post(PostId(Uuid::from_u128(id))), UserId::stub(), date);
        v.score = score;
        v
    }

    fn ids(v: &[Votable]) -> Vec<u128> {
        v.iter().map(|v| v.id.uuid().as_u128()).collect()
    }

    #[test]
    fn top_breaks_ties_with_newest_first() {
        let now = chrono::Utc::now();
        let mut items = vec![
            at(1, 3, now - Duration::hours(5)),
            at(2, 3, now - Duration::hours(1)),
            at(3, 5, now - Duration::hours(9)),
        ];
        Ranking::Top.sort(&mut items, now);
        assert_eq!(ids(&items), vec![3, 2, 1]);
    }

    #[test]
    fn new_ignores_scores() {
        let now = chrono::Utc::now();
        let mut items = vec![
            at(1, 100, now - Duration::days(3)),
            at(2, -4, now),
            at(3, 0, now - Duration::minutes(1)),
        ];
        Ranking::New.sort(&mut items, now);
        assert_eq!(ids(&items), vec![2, 3, 1]);
    }

    #[test]
    fn hot_decays_with_age() {
        let now = chrono::Utc::now();
        let mut items = vec![
            at(1, 50, now - Duration::days(30)),
            at(2, 10, now - Duration::hours(1)),
            at(3, 0, now),
            at(4, -2, now),
        ];
        Ranking::Hot.sort(&mut items, now);
        // a fresh 10 beats a month-old 50, and a neutral item beats a downvoted one
        assert_eq!(ids(&items), vec![2, 1, 3, 4]);
    }

    #[test]
    fn orderings_are_total() {
        let now = chrono::Utc::now();
        let mut items = vec![at(7, 1, now), at(5, 1, now), at(6, 1, now)];
        for r in [Ranking::New, Ranking::Top, Ranking::Hot] {
            r.sort(&mut items, now);
            assert_eq!(ids(&items), vec![5, 6, 7]);
        }
    }
}
