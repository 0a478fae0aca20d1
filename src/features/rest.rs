//! Days of rest between a team's consecutive games, home or away.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::db::models::GameEvent;
use crate::error::{PipelineError, Result};

/// Rest for a team's first recorded game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstGameRest {
    /// Zero days, then clipped like any other value
    #[default]
    Zero,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestPolicy {
    pub min_days: i64,
    pub max_days: i64,
    pub first_game: FirstGameRest,
}

impl Default for RestPolicy {
    fn default() -> Self {
        // Offseason gaps of months would otherwise dominate the feature.
        RestPolicy {
            min_days: 0,
            max_days: 10,
            first_game: FirstGameRest::Zero,
        }
    }
}

impl RestPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.min_days > self.max_days {
            return Err(PipelineError::Config(format!(
                "rest_min {} is above rest_max {}",
                self.min_days, self.max_days
            )));
        }
        Ok(())
    }

    fn clip(&self, days: i64) -> i64 {
        days.clamp(self.min_days, self.max_days)
    }
}

/// Rest attributed to each side of one game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestDays {
    pub home: Option<i64>,
    pub away: Option<i64>,
}

impl RestDays {
    pub fn advantage(&self) -> Option<i64> {
        Some(self.home? - self.away?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestTable {
    by_game: HashMap<String, RestDays>,
}

impl RestTable {
    pub fn get(&self, game_id: &str) -> Option<RestDays> {
        self.by_game.get(game_id).copied()
    }

    /// Rest of `team` going into `game_id`, looked up by which side it played.
    pub fn for_team(&self, game: &GameEvent, team: &str) -> Option<i64> {
        let rest = self.by_game.get(&game.game_id)?;
        match game.is_home(team)? {
            true => rest.home,
            false => rest.away,
        }
    }

    pub fn len(&self) -> usize {
        self.by_game.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_game.is_empty()
    }
}

/// Walk the schedule in `(date, game_id)` order, reading each team's previous
/// date before recording the current one.
pub fn compute_rest_days(games: &[GameEvent], policy: &RestPolicy) -> RestTable {
    let mut order: Vec<&GameEvent> = games.iter().collect();
    order.sort_by(|a, b| (a.date, &a.game_id).cmp(&(b.date, &b.game_id)));

    let mut last_played = HashMap::new();
    let mut by_game = HashMap::with_capacity(order.len());
    for game in order {
        let mut rest_for = |team: &str| {
            let days = match last_played.insert(team.to_string(), game.date) {
                Some(prev) => Some((game.date - prev).num_days()),
                None => match policy.first_game {
                    FirstGameRest::Zero => Some(0),
                    FirstGameRest::Missing => None,
                },
            };
            days.map(|d| policy.clip(d))
        };
        let home = rest_for(&game.home_entity_id);
        let away = rest_for(&game.away_entity_id);
        by_game.insert(game.game_id.clone(), RestDays { home, away });
    }
    RestTable { by_game }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::season::SeasonPhase;
    use chrono::NaiveDate;

    fn game(id: &str, day: u32, home: &str, away: &str) -> GameEvent {
        GameEvent {
            game_id: id.into(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            home_entity_id: home.into(),
            away_entity_id: away.into(),
            home_score: None,
            away_score: None,
            season_label: None,
            phase: SeasonPhase::Other,
            source: "test".into(),
            seq: 0,
        }
    }

    #[test]
    fn gap_counts_games_on_either_side() {
        let games = vec![game("g1", 1, "T1", "T2"), game("g2", 5, "T3", "T1")];
        let rest = compute_rest_days(&games, &RestPolicy::default());
        assert_eq!(rest.get("g2").unwrap().away, Some(4));
        assert_eq!(rest.for_team(&games[1], "T1"), Some(4));
        assert_eq!(rest.get("g2").unwrap().home, Some(0));
    }

    #[test]
    fn values_are_clipped() {
        let games = vec![game("g1", 1, "T1", "T2"), game("g2", 5, "T1", "T2")];
        let policy = RestPolicy {
            max_days: 3,
            ..Default::default()
        };
        let rest = compute_rest_days(&games, &policy);
        assert_eq!(rest.get("g2"), Some(RestDays { home: Some(3), away: Some(3) }));
    }

    #[test]
    fn first_game_policy() {
        let games = vec![game("g1", 1, "T1", "T2")];
        let zero = compute_rest_days(&games, &RestPolicy::default());
        assert_eq!(zero.get("g1").unwrap().home, Some(0));

        let lifted = RestPolicy {
            min_days: 1,
            ..Default::default()
        };
        assert_eq!(compute_rest_days(&games, &lifted).get("g1").unwrap().home, Some(1));

        let missing = RestPolicy {
            first_game: FirstGameRest::Missing,
            ..Default::default()
        };
        let rest = compute_rest_days(&games, &missing).get("g1").unwrap();
        assert_eq!(rest, RestDays { home: None, away: None });
        assert_eq!(rest.advantage(), None);
    }

    #[test]
    fn every_value_stays_within_bounds() {
        let days = [1, 2, 2, 9, 30, 31];
        let games: Vec<GameEvent> = days
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let (h, a) = if i % 2 == 0 { ("T1", "T2") } else { ("T2", "T3") };
                game(&format!("g{}", i), *d, h, a)
            })
            .collect();
        let policy = RestPolicy {
            min_days: 1,
            max_days: 7,
            first_game: FirstGameRest::Zero,
        };
        let rest = compute_rest_days(&games, &policy);
        assert_eq!(rest.len(), games.len());
        for g in &games {
            let r = rest.get(&g.game_id).unwrap();
            for v in [r.home, r.away].into_iter().flatten() {
                assert!((policy.min_days..=policy.max_days).contains(&v));
            }
        }
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let policy = RestPolicy {
            min_days: 5,
            max_days: 2,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
