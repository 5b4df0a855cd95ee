// Splitting of oversized events

use serde_json::Value;

use super::Event;

const EXECUTE_CONVERGENCE_MESSAGE: &str = "Executing convergence";

/// Split a slice in two, the left half taking the extra element
pub fn halve<T>(elements: &[T]) -> (&[T], &[T]) {
    elements.split_at(elements.len().div_ceil(2))
}

/// Partition `elements` into chunks whose rendering fits in `max_len`.
///
/// A single element that renders too long is still returned on its own, so
/// `max_len` is not a hard bound.
pub fn split<T, F>(render: &F, elements: &[T], max_len: usize) -> Vec<Vec<T>>
where
    T: Clone,
    F: Fn(&[T]) -> String,
{
    if elements.len() > 1 && render(elements).len() > max_len {
        let (left, right) = halve(elements);
        let mut parts = split(render, left, max_len);
        parts.extend(split(render, right, max_len));
        parts
    } else {
        vec![elements.to_vec()]
    }
}

/// Break an oversized `execute-convergence` event apart.
///
/// The largest of the `servers` and `lb_nodes` lists is moved into separate
/// events first; the second only if the remainder is still too long. The
/// remainder comes first in the result.
pub fn split_execute_convergence(event: Event, max_length: usize) -> Vec<(Event, String)> {
    let message = EXECUTE_CONVERGENCE_MESSAGE.to_string();
    if event.serialized_len() <= max_length {
        return vec![(event, message)];
    }

    let mut large: Vec<(&str, usize)> = ["servers", "lb_nodes"]
        .into_iter()
        .filter_map(|key| {
            event
                .get(key)
                .map(|value| (key, value.to_string().len()))
        })
        .collect();
    large.sort_by(|a, b| b.1.cmp(&a.1));

    let base = event.without(&["desired", "servers", "lb_nodes", "steps"]);
    let part = |key: &str, items: &[Value]| {
        let mut e = base.clone();
        e.insert(key, Value::Array(items.to_vec()));
        e
    };

    let mut remainder = event;
    let mut parts = Vec::new();
    for (key, _) in large {
        let items = match remainder.remove(key) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                remainder.insert(key, other);
                continue;
            }
            None => continue,
        };
        let render = |chunk: &[Value]| part(key, chunk).to_string();
        for chunk in split(&render, &items, max_length) {
            parts.push((part(key, &chunk), message.clone()));
        }
        if remainder.serialized_len() <= max_length {
            break;
        }
    }

    let mut events = vec![(remainder, message)];
    events.extend(parts);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_halve_is_left_biased() {
        let items = [1, 2, 3, 4, 5];
        assert_eq!(halve(&items), (&[1, 2, 3][..], &[4, 5][..]));
        let empty: [u8; 0] = [];
        assert_eq!(halve(&empty).0.len(), 0);
    }

    #[test]
    fn test_split_fits() {
        let render = |items: &[u32]| format!("{items:?}");
        assert_eq!(split(&render, &[1, 2, 3], 100), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_split_recursive() {
        let render = |items: &[&str]| items.concat();
        let parts = split(&render, &["aaaa", "bbbb", "cccc", "dddd", "eeee"], 8);
        assert_eq!(
            parts,
            vec![
                vec!["aaaa", "bbbb"],
                vec!["cccc"],
                vec!["dddd", "eeee"],
            ]
        );
    }

    #[test]
    fn test_split_single_oversized_element() {
        let render = |items: &[&str]| items.concat();
        assert_eq!(split(&render, &["toolong"], 3), vec![vec!["toolong"]]);
    }

    #[test]
    fn test_small_event_is_untouched() {
        let event = Event::new("execute-convergence").with("servers", json!([1, 2]));
        let events = split_execute_convergence(event.clone(), 1000);
        assert_eq!(events, vec![(event, "Executing convergence".to_string())]);
    }

    #[test]
    fn test_large_event_splits_servers() {
        let servers: Vec<String> = (0..20).map(|i| format!("server-{i:04}-{}", "x".repeat(40))).collect();
        let event = Event::new("execute-convergence")
            .with("scaling_group_id", "g1")
            .with("desired", json!({"capacity": 20}))
            .with("servers", &servers)
            .with("lb_nodes", json!(["n1"]))
            .with("steps", json!(["s1"]));

        let max = 400;
        let events = split_execute_convergence(event, max);
        assert!(events.len() > 2);

        let (remainder, _) = &events[0];
        assert!(remainder.get("servers").is_none());
        assert_eq!(remainder.get("lb_nodes"), Some(&json!(["n1"])));

        let mut rejoined = Vec::new();
        for (part, message) in &events[1..] {
            assert_eq!(message, "Executing convergence");
            assert!(part.serialized_len() <= max);
            assert_eq!(part.get("scaling_group_id"), Some(&json!("g1")));
            assert!(part.get("desired").is_none());
            assert!(part.get("steps").is_none());
            for server in part.get("servers").and_then(Value::as_array).unwrap() {
                rejoined.push(server.as_str().unwrap().to_string());
            }
        }
        assert_eq!(rejoined, servers);
    }
}
