//! Filter evaluation and value ordering for the in-memory collection.
//!
//! Supports the subset of the Mongo query language the queue and its callers
//! need: implicit equality, `$eq $ne $gt $gte $lt $lte $in $nin $exists`,
//! top-level `$and $or $nor` and dotted paths. Comparison follows BSON type
//! order (null < numbers < strings < objects < arrays < booleans) and range
//! operators only match values of the same type class.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::ports::{Direction, Document, KeyPattern, StoreError};

pub(crate) fn matches(doc: &Document, filter: &Document) -> Result<bool, StoreError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(doc, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => any_clause(doc, key, condition)?,
            "$nor" => !any_clause(doc, key, condition)?,
            op if op.starts_with('$') => {
                return Err(StoreError::InvalidQuery(format!(
                    "unknown top-level operator {op}"
                )));
            }
            path => field_matches(lookup(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_clause(doc: &Document, op: &str, condition: &Value) -> Result<bool, StoreError> {
    for clause in clauses(op, condition)? {
        if matches(doc, clause)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn clauses<'a>(op: &str, value: &'a Value) -> Result<Vec<&'a Document>, StoreError> {
    let Value::Array(items) = value else {
        return Err(StoreError::InvalidQuery(format!("{op} expects an array")));
    };
    if items.is_empty() {
        return Err(StoreError::InvalidQuery(format!(
            "{op} expects a non-empty array"
        )));
    }
    items
        .iter()
        .map(|item| match item {
            Value::Object(clause) => Ok(clause),
            _ => Err(StoreError::InvalidQuery(format!(
                "{op} clauses must be objects"
            ))),
        })
        .collect()
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at a dotted path, creating intermediate objects.
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), StoreError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return Err(StoreError::InvalidQuery("empty field path".to_string()));
    };
    let mut current = doc;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(StoreError::InvalidQuery(format!(
                    "cannot create field {path:?}: {segment:?} is not an object"
                )));
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn is_operator_object(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(value: Option<&Value>, condition: &Value) -> Result<bool, StoreError> {
    let Value::Object(ops) = condition else {
        return Ok(equals(value, condition));
    };
    if !is_operator_object(condition) {
        return Ok(equals(value, condition));
    }
    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(value, arg),
            "$ne" => !equals(value, arg),
            "$gt" => range(value, arg, |o| o == Ordering::Greater),
            "$gte" => range(value, arg, |o| o != Ordering::Less),
            "$lt" => range(value, arg, |o| o == Ordering::Less),
            "$lte" => range(value, arg, |o| o != Ordering::Greater),
            "$in" => in_list(op, value, arg)?,
            "$nin" => !in_list(op, value, arg)?,
            "$exists" => value.is_some() == truthy(arg),
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "unknown operator {other}"
                )));
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Missing fields equal `null`; array fields match when any element does.
fn equals(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        None => expected.is_null(),
        Some(actual) => {
            values_equal(actual, expected)
                || match actual {
                    Value::Array(items) if !expected.is_array() => {
                        items.iter().any(|item| values_equal(item, expected))
                    }
                    _ => false,
                }
        }
    }
}

fn range(value: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(actual) = value else {
        return false;
    };
    let check = |candidate: &Value| {
        type_rank(candidate) == type_rank(bound) && accept(compare_values(candidate, bound))
    };
    match actual {
        Value::Array(items) if !bound.is_array() => items.iter().any(check),
        other => check(other),
    }
}

fn in_list(op: &str, value: Option<&Value>, arg: &Value) -> Result<bool, StoreError> {
    let Value::Array(candidates) = arg else {
        return Err(StoreError::InvalidQuery(format!("{op} expects an array")));
    };
    Ok(candidates.iter().any(|candidate| equals(value, candidate)))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => true,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 6,
    }
}

/// Total order over JSON values.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Exact for integers, falls back to `f64` when either side is fractional.
fn compare_numbers(x: &Number, y: &Number) -> Ordering {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a.cmp(&b);
    }
    let a = x.as_f64().unwrap_or(f64::NAN);
    let b = y.as_f64().unwrap_or(f64::NAN);
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Compare two documents by a sort key pattern. Missing fields sort as null.
pub(crate) fn compare_documents(a: &Document, b: &Document, sort: &KeyPattern) -> Ordering {
    for (field, direction) in sort.fields() {
        let l = lookup(a, field).unwrap_or(&Value::Null);
        let r = lookup(b, field).unwrap_or(&Value::Null);
        let ord = match direction {
            Direction::Ascending => compare_values(l, r),
            Direction::Descending => compare_values(r, l),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Fields an upsert copies from its filter: plain equalities and `$eq`.
pub(crate) fn upsert_seed(filter: &Document) -> Result<Document, StoreError> {
    let mut seed = Document::new();
    for (key, condition) in filter {
        if key.starts_with('$') {
            continue;
        }
        if !is_operator_object(condition) {
            set_path(&mut seed, key, condition.clone())?;
        } else if let Some(value) = condition.get("$eq") {
            set_path(&mut seed, key, value.clone())?;
        }
    }
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn sample() -> Document {
        doc(json!({
            "_id": "a",
            "earliestGet": 1_000,
            "priority": 0.5,
            "payload": {
                "type": "email",
                "attempt": 2,
                "tags": ["x", "y"],
                "user": {"id": 7, "name": "ann"},
                "flag": true,
                "nothing": null
            }
        }))
    }

    #[rstest]
    #[case::eq_implicit(json!({"payload.type": "email"}), true)]
    #[case::eq_implicit_miss(json!({"payload.type": "sms"}), false)]
    #[case::nested(json!({"payload.user.id": 7}), true)]
    #[case::int_float_equal(json!({"payload.attempt": 2.0}), true)]
    #[case::array_contains(json!({"payload.tags": "y"}), true)]
    #[case::array_whole(json!({"payload.tags": ["x", "y"]}), true)]
    #[case::array_index(json!({"payload.tags.1": "y"}), true)]
    #[case::missing_eq_null(json!({"payload.missing": null}), true)]
    #[case::explicit_null(json!({"payload.nothing": null}), true)]
    #[case::object_eq(json!({"payload.user": {"id": 7, "name": "ann"}}), true)]
    #[case::lte_hit(json!({"earliestGet": {"$lte": 1_000}}), true)]
    #[case::lt_miss(json!({"earliestGet": {"$lt": 1_000}}), false)]
    #[case::gt_hit(json!({"earliestGet": {"$gt": 999}}), true)]
    #[case::gte_range(json!({"payload.attempt": {"$gte": 1, "$lt": 3}}), true)]
    #[case::range_type_bracketing(json!({"payload.type": {"$gt": 5}}), false)]
    #[case::range_missing(json!({"payload.missing": {"$lt": 5}}), false)]
    #[case::ne(json!({"payload.type": {"$ne": "sms"}}), true)]
    #[case::ne_missing(json!({"payload.missing": {"$ne": 1}}), true)]
    #[case::in_hit(json!({"payload.type": {"$in": ["sms", "email"]}}), true)]
    #[case::nin_hit(json!({"payload.type": {"$nin": ["sms", "email"]}}), false)]
    #[case::exists(json!({"payload.flag": {"$exists": true}}), true)]
    #[case::not_exists(json!({"payload.missing": {"$exists": false}}), true)]
    #[case::or(json!({"$or": [{"payload.type": "sms"}, {"payload.flag": true}]}), true)]
    #[case::and(json!({"$and": [{"payload.type": "email"}, {"payload.flag": false}]}), false)]
    #[case::nor(json!({"$nor": [{"payload.type": "sms"}]}), true)]
    #[case::multiple_fields(json!({"payload.type": "email", "earliestGet": {"$lte": 0}}), false)]
    fn filter_cases(#[case] filter: Value, #[case] expected: bool) {
        assert_eq!(matches(&sample(), &doc(filter)).unwrap(), expected);
    }

    #[rstest]
    #[case::unknown_top_level(json!({"$where": "1"}))]
    #[case::unknown_field_op(json!({"a": {"$regex": "x"}}))]
    #[case::or_not_array(json!({"$or": {"a": 1}}))]
    #[case::or_empty(json!({"$or": []}))]
    #[case::in_not_array(json!({"a": {"$in": 1}}))]
    fn invalid_filters(#[case] filter: Value) {
        assert!(matches!(
            matches(&sample(), &doc(filter)),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn large_integers_compare_exactly() {
        let big = i64::MAX - 1;
        let d = doc(json!({"t": big}));
        assert!(matches(&d, &doc(json!({"t": {"$lt": i64::MAX}}))).unwrap());
        assert!(!matches(&d, &doc(json!({"t": {"$gte": i64::MAX}}))).unwrap());
    }

    #[test]
    fn type_order() {
        let ordered = [
            json!(null),
            json!(-1),
            json!(2.5),
            json!("a"),
            json!({"k": 1}),
            json!([1]),
            json!(false),
            json!(true),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn compare_documents_honours_direction_and_order() {
        let sort = KeyPattern::new()
            .with("priority", Direction::Ascending)
            .with("created", Direction::Descending);
        let a = doc(json!({"priority": 1, "created": 5}));
        let b = doc(json!({"priority": 1, "created": 9}));
        let c = doc(json!({"priority": 0.5, "created": 1}));
        assert_eq!(compare_documents(&b, &a, &sort), Ordering::Less);
        assert_eq!(compare_documents(&c, &a, &sort), Ordering::Less);
        assert_eq!(compare_documents(&a, &a, &sort), Ordering::Equal);
    }

    #[test]
    fn set_path_creates_intermediate_objects() {
        let mut d = Document::new();
        set_path(&mut d, "a.b.c", json!(1)).unwrap();
        assert_eq!(Value::Object(d.clone()), json!({"a": {"b": {"c": 1}}}));

        set_path(&mut d, "a.b.d", json!(2)).unwrap();
        assert_eq!(lookup(&d, "a.b.d"), Some(&json!(2)));

        d.insert("n".to_string(), json!(5));
        assert!(set_path(&mut d, "n.x", json!(1)).is_err());
    }

    #[test]
    fn upsert_seed_takes_equalities_only() {
        let filter = doc(json!({
            "_id": "abc",
            "payload.kind": {"$eq": "x"},
            "earliestGet": {"$lte": 5},
            "$or": [{"a": 1}]
        }));
        let seed = upsert_seed(&filter).unwrap();
        assert_eq!(
            Value::Object(seed),
            json!({"_id": "abc", "payload": {"kind": "x"}})
        );
    }
}
