use std::collections::HashMap;
use std::hash::Hash;

/// Plurality vote over repeated observations of one field.
///
/// Missing observations are ignored. The most frequent present value wins;
/// when the top count is shared the first present value is used.
pub fn consensus<T>(observations: &[Option<T>]) -> Option<T>
where
    T: Clone + Eq + Hash,
{
    let present: Vec<&T> = observations.iter().flatten().collect();
    let first = present.first()?;

    let mut counts: HashMap<&T, usize> = HashMap::new();
    for value in &present {
        *counts.entry(*value).or_default() += 1;
    }

    let top = counts.values().copied().max().unwrap_or(0);
    let mut leaders = counts.into_iter().filter(|(_, n)| *n == top);
    let winner = match (leaders.next(), leaders.next()) {
        (Some((value, _)), None) => value,
        _ => *first,
    };

    Some(winner.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(String::from)).collect()
    }

    #[test]
    fn most_frequent_wins() {
        let votes = obs(&[Some("120"), Some("120"), Some("125")]);
        assert_eq!(consensus(&votes).as_deref(), Some("120"));
    }

    #[test]
    fn winner_need_not_come_first() {
        let votes = obs(&[Some("125"), Some("120"), Some("120")]);
        assert_eq!(consensus(&votes).as_deref(), Some("120"));
    }

    #[test]
    fn all_distinct_falls_back_to_first() {
        let votes = obs(&[Some("a"), Some("b"), Some("c")]);
        assert_eq!(consensus(&votes).as_deref(), Some("a"));
    }

    #[test]
    fn missing_observations_do_not_vote() {
        let votes = obs(&[None, Some("b"), None]);
        assert_eq!(consensus(&votes).as_deref(), Some("b"));
        assert_eq!(consensus::<String>(&[None, None]), None);
    }

    #[test]
    fn even_split_falls_back_to_first() {
        let votes = obs(&[Some("x"), Some("y"), Some("y"), Some("x")]);
        assert_eq!(consensus(&votes).as_deref(), Some("x"));
    }

    #[test]
    fn plurality_wins_across_five_passes() {
        let votes = obs(&[Some("a"), Some("b"), Some("b"), Some("c"), Some("d")]);
        assert_eq!(consensus(&votes).as_deref(), Some("b"));
    }

    #[test]
    fn shared_top_count_falls_back_to_first() {
        let votes = obs(&[Some("a"), Some("b"), Some("b"), Some("c"), Some("c")]);
        assert_eq!(consensus(&votes).as_deref(), Some("a"));
    }
}
