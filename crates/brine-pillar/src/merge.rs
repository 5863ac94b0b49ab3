//! Merging of pillar sources.
//!
//! Values are kept as YAML so the `!aggregate` and `!reset` tags written in
//! SLS files survive until merging is finished.

use brine_config::MergeStrategy;
use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Value};

const AGGREGATE_TAG: &str = "aggregate";
const RESET_TAG: &str = "reset";

fn tag_name(tag: &Tag) -> String {
    tag.to_string().trim_start_matches('!').to_string()
}

/// Split a value into its untagged form and its aggregate/reset markers.
fn peel(value: Value) -> (Value, bool, bool) {
    match value {
        Value::Tagged(tagged) => {
            let name = tag_name(&tagged.tag);
            let TaggedValue { value, .. } = *tagged;
            (value, name == AGGREGATE_TAG, name == RESET_TAG)
        }
        other => (other, false, false),
    }
}

/// Drop every tag, recursively.
pub fn untag(value: Value) -> Value {
    match value {
        Value::Tagged(tagged) => untag(tagged.value),
        Value::Mapping(map) => Value::Mapping(
            map.into_iter().map(|(k, v)| (untag(k), untag(v))).collect(),
        ),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(untag).collect()),
        other => other,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Mapping(m) => m.is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::Tagged(t) => is_empty(&t.value),
        _ => false,
    }
}

/// Merge `b` into `a`; `b` is the later, higher-priority source.
///
/// `renderer` is only consulted by `smart`, which aggregates for `yamlex`
/// and recurses otherwise.
pub fn merge(a: Value, b: Value, strategy: MergeStrategy, renderer: &str, merge_lists: bool) -> Value {
    match strategy {
        MergeStrategy::Smart if renderer == "yamlex" => aggregate(a, b, true),
        MergeStrategy::Smart | MergeStrategy::Recurse => {
            recurse(untag(a), untag(b), merge_lists)
        }
        MergeStrategy::Aggregate => aggregate(a, b, true),
        MergeStrategy::Overwrite => overwrite(untag(a), untag(b), merge_lists),
        MergeStrategy::None => {
            if is_empty(&a) {
                untag(b)
            } else {
                untag(a)
            }
        }
    }
}

fn recurse(a: Value, b: Value, merge_lists: bool) -> Value {
    match (a, b) {
        (Value::Mapping(mut dest), Value::Mapping(upd)) => {
            for (key, val) in upd {
                let merged = match dest.remove(&key) {
                    Some(Value::Mapping(cur)) if val.is_mapping() => {
                        recurse(Value::Mapping(cur), val, merge_lists)
                    }
                    Some(Value::Sequence(mut cur)) if merge_lists && val.is_sequence() => {
                        if let Value::Sequence(items) = val {
                            for item in items {
                                if !cur.contains(&item) {
                                    cur.push(item);
                                }
                            }
                        }
                        Value::Sequence(cur)
                    }
                    _ => val,
                };
                dest.insert(key, merged);
            }
            Value::Mapping(dest)
        }
        (_, b) => b,
    }
}

fn overwrite(a: Value, b: Value, merge_lists: bool) -> Value {
    match (a, b) {
        (Value::Mapping(mut dest), Value::Mapping(upd)) => {
            for (key, val) in &upd {
                if dest.contains_key(key) {
                    dest.insert(key.clone(), val.clone());
                }
            }
            recurse(Value::Mapping(dest), Value::Mapping(upd), merge_lists)
        }
        (_, b) => b,
    }
}

/// Aggregation: marked maps keep keys from both sides and marked sequences
/// concatenate. Anything unmarked takes the later value, recursing into
/// keys the two maps share. The outermost level is always marked.
fn aggregate(a: Value, b: Value, level: bool) -> Value {
    let (a, a_tagged, _) = peel(a);
    let (b, b_tagged, b_reset) = peel(b);
    if b_reset {
        return untag(b);
    }
    let both = (a_tagged || level) && (b_tagged || level);

    let merged = match (a, b) {
        (Value::Mapping(left), Value::Mapping(right)) => {
            let mut out: Mapping = if both { left.clone() } else { Mapping::new() };
            for (key, val) in right {
                let value = match left.get(&key) {
                    Some(cur) => aggregate(cur.clone(), val, false),
                    None => val,
                };
                out.insert(key, value);
            }
            Value::Mapping(out)
        }
        (Value::Sequence(mut left), Value::Sequence(right)) if both => {
            left.extend(right);
            Value::Sequence(left)
        }
        (_, b) => b,
    };

    // keep the marker so a third source still aggregates with this result
    if b_tagged {
        Value::Tagged(Box::new(TaggedValue {
            tag: Tag::new(AGGREGATE_TAG),
            value: merged,
        }))
    } else {
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn y(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn recurse_later_source_wins() {
        let a = y("A: {first_key: blah, second_key: blah}\nB: 1\n");
        let b = y("A: {third_key: 2, first_key: other}\n");
        let merged = merge(a, b, MergeStrategy::Recurse, "yaml", false);
        assert_eq!(
            merged,
            y("A: {first_key: other, second_key: blah, third_key: 2}\nB: 1\n")
        );
    }

    #[test]
    fn overwrite_replaces_top_level_keys() {
        let a = y("A: {first_key: blah, second_key: blah}\n");
        let b = y("A: {third_key: 2}\n");
        let merged = merge(a, b, MergeStrategy::Overwrite, "yaml", false);
        assert_eq!(merged, y("A: {third_key: 2}\n"));
    }

    #[test]
    fn aggregate_self_merge_duplicates_list() {
        let list = y("[nginx]");
        let merged = merge(list.clone(), list, MergeStrategy::Aggregate, "yaml", false);
        assert_eq!(merged, y("[nginx, nginx]"));
    }

    #[test]
    fn aggregate_honours_tags() {
        let a = y("pkgs: !aggregate [vim]\nusers: {alice: 1}\n");
        let b = y("pkgs: !aggregate [git]\nusers: {bob: 2}\n");
        let merged = untag(merge(a, b, MergeStrategy::Aggregate, "yaml", false));
        // unmarked nested map takes the later keys only
        assert_eq!(merged, y("pkgs: [vim, git]\nusers: {bob: 2}\n"));

        let c = y("pkgs: !reset [emacs]\n");
        let reset = untag(merge(merged, c, MergeStrategy::Aggregate, "yaml", false));
        assert_eq!(reset["pkgs"], y("[emacs]"));
        assert_eq!(reset["users"], y("{bob: 2}"));
    }

    #[test]
    fn aggregate_marker_survives_three_sources() {
        let mut acc = Value::Mapping(Mapping::new());
        for item in ["a", "b", "c"] {
            let src = y(&format!("list: !aggregate [{item}]\n"));
            acc = merge(acc, src, MergeStrategy::Aggregate, "yaml", false);
        }
        assert_eq!(untag(acc), y("list: [a, b, c]\n"));
    }

    #[test]
    fn smart_depends_on_renderer() {
        let a = y("[x]");
        assert_eq!(
            merge(a.clone(), a.clone(), MergeStrategy::Smart, "yaml", false),
            y("[x]")
        );
        assert_eq!(
            merge(a.clone(), a, MergeStrategy::Smart, "yamlex", false),
            y("[x, x]")
        );
    }

    #[test]
    fn merge_lists_dedupes() {
        let a = y("roles: [web, db]\n");
        let b = y("roles: [db, cache]\n");
        let merged = merge(a.clone(), b.clone(), MergeStrategy::Recurse, "yaml", true);
        assert_eq!(merged, y("roles: [web, db, cache]\n"));
        let replaced = merge(a, b, MergeStrategy::Recurse, "yaml", false);
        assert_eq!(replaced, y("roles: [db, cache]\n"));
    }

    #[test]
    fn none_keeps_first_source() {
        let empty = Value::Mapping(Mapping::new());
        let first = y("a: 1\n");
        let kept = merge(empty, first.clone(), MergeStrategy::None, "yaml", false);
        assert_eq!(kept, first);
        let still = merge(kept, y("a: 2\nb: 3\n"), MergeStrategy::None, "yaml", false);
        assert_eq!(still, first);
    }
}
