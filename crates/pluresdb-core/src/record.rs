//! Replicated record model and the merge operator.
//!
//! A [`NodeRecord`] is the unit of replication: a JSON object payload plus
//! the metadata the merge needs — per-field write timestamps, a vector
//! clock, and writer identities. [`NodeRecord::merge`] is the deterministic
//! binary operator every peer applies; it is commutative and idempotent, so
//! peers that see the same set of records in any order converge.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Unique identifier for a stored record.
pub type NodeId = String;

/// Stable identifier of a running peer.
pub type PeerId = String;

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// A key-value map of logical clocks per peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<PeerId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock for `peer_id` and returns the new counter.
    pub fn increment(&mut self, peer_id: &str) -> u64 {
        let counter = self.clocks.entry(peer_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn get(&self, peer_id: &str) -> u64 {
        self.clocks.get(peer_id).copied().unwrap_or(0)
    }

    /// Pointwise maximum with `other`.
    pub fn merge(&mut self, other: &VectorClock) {
        for (peer_id, &counter) in &other.clocks {
            let current = self.clocks.entry(peer_id.clone()).or_insert(0);
            *current = (*current).max(counter);
        }
    }

    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// True when every entry of `other` is covered by this clock.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .clocks
            .iter()
            .all(|(peer_id, &counter)| self.get(peer_id) >= counter)
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    fn largest_peer(&self) -> Option<&str> {
        self.clocks.keys().next_back().map(String::as_str)
    }
}

/// The unit of replicated state.
///
/// Serialized attribute names are part of the wire and storage formats;
/// `fieldWriters` and `writerId` record which peer last wrote each field
/// and the record as a whole. Whole-record metadata (the vector clock, the
/// record timestamp) drifts away from any single field after a merge, so
/// per-field tie-breaks have to carry their own writer identity to stay
/// order-independent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub data: Map<String, JsonValue>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    pub timestamp: TimestampMs,
    #[serde(default)]
    pub state: HashMap<String, TimestampMs>,
    #[serde(rename = "vectorClock", default)]
    pub vector_clock: VectorClock,
    #[serde(rename = "writerId", default, skip_serializing_if = "Option::is_none")]
    pub writer_id: Option<PeerId>,
    #[serde(rename = "fieldWriters", default, skip_serializing_if = "HashMap::is_empty")]
    pub field_writers: HashMap<String, PeerId>,
}

impl NodeRecord {
    /// Builds the record a local write produces before it is merged with
    /// whatever is already stored: every incoming field stamped with the
    /// write timestamp and attributed to the writing peer.
    pub fn local_write(
        id: NodeId,
        data: Map<String, JsonValue>,
        node_type: Option<String>,
        vector: Option<Vec<f32>>,
        timestamp: TimestampMs,
        clock: VectorClock,
        peer_id: &str,
    ) -> Self {
        let mut state = HashMap::with_capacity(data.len());
        let mut field_writers = HashMap::with_capacity(data.len());
        for field in data.keys() {
            state.insert(field.clone(), timestamp);
            field_writers.insert(field.clone(), peer_id.to_string());
        }
        Self {
            id,
            data,
            node_type,
            vector,
            timestamp,
            state,
            vector_clock: clock,
            writer_id: Some(peer_id.to_string()),
            field_writers,
        }
    }

    /// Writer identity used for tie-breaks on field `field`.
    fn field_writer(&self, field: &str) -> &str {
        self.field_writers
            .get(field)
            .map(String::as_str)
            .unwrap_or_else(|| self.record_writer())
    }

    /// Writer identity of the record as a whole.
    fn record_writer(&self) -> &str {
        self.writer_id
            .as_deref()
            .or_else(|| self.vector_clock.largest_peer())
            .unwrap_or("")
    }

    /// Merges `incoming` into `local`, field by field.
    ///
    /// Each field goes to the side with the larger per-field timestamp;
    /// exact ties fall to the lexicographically larger writer id. Fields
    /// present on one side only are kept. Record-level attributes (vector,
    /// type, writer) follow the newer record, preferring the incoming side
    /// on ties; timestamp, state, and vector clock take pointwise maxima.
    pub fn merge(local: Option<&NodeRecord>, incoming: &NodeRecord) -> NodeRecord {
        let Some(local) = local else {
            return incoming.clone();
        };

        let fields: BTreeSet<&String> = local.data.keys().chain(incoming.data.keys()).collect();
        let mut data = Map::new();
        let mut field_writers = HashMap::new();
        for &field in &fields {
            match (local.data.get(field.as_str()), incoming.data.get(field.as_str())) {
                (Some(local_value), Some(incoming_value)) => {
                    let (value, writer) = if incoming_field_wins(local, incoming, field) {
                        (incoming_value, incoming.field_writer(field))
                    } else {
                        (local_value, local.field_writer(field))
                    };
                    data.insert(field.clone(), value.clone());
                    field_writers.insert(field.clone(), writer.to_string());
                }
                (Some(local_value), None) => {
                    if keep_one_sided(local, incoming, field) {
                        data.insert(field.clone(), local_value.clone());
                        field_writers.insert(field.clone(), local.field_writer(field).to_string());
                    }
                }
                (None, Some(incoming_value)) => {
                    if keep_one_sided(incoming, local, field) {
                        data.insert(field.clone(), incoming_value.clone());
                        field_writers
                            .insert(field.clone(), incoming.field_writer(field).to_string());
                    }
                }
                (None, None) => unreachable!("field taken from the union of both sides"),
            }
        }

        let incoming_is_newer = match incoming.timestamp.cmp(&local.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                match incoming.record_writer().cmp(local.record_writer()) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => {
                        record_payload_rank(incoming) >= record_payload_rank(local)
                    }
                }
            }
        };
        let (vector, node_type, writer_id) = if incoming_is_newer {
            (
                incoming.vector.clone(),
                incoming.node_type.clone(),
                incoming.writer_id.clone(),
            )
        } else {
            (
                local.vector.clone(),
                local.node_type.clone(),
                local.writer_id.clone(),
            )
        };

        let mut state = HashMap::with_capacity(data.len());
        for field in data.keys() {
            let merged_ts = local
                .state
                .get(field)
                .copied()
                .unwrap_or(0)
                .max(incoming.state.get(field).copied().unwrap_or(0));
            state.insert(field.clone(), merged_ts);
        }

        NodeRecord {
            id: local.id.clone(),
            data,
            node_type,
            vector,
            timestamp: local.timestamp.max(incoming.timestamp),
            state,
            vector_clock: local.vector_clock.merged(&incoming.vector_clock),
            writer_id,
            field_writers,
        }
    }
}

/// Winner of a field present on both sides: larger per-field timestamp,
/// then lexicographically larger writer id, then larger serialized value.
/// The value comparison covers two writes by the same peer inside one
/// millisecond, where timestamp and writer cannot separate them.
fn incoming_field_wins(local: &NodeRecord, incoming: &NodeRecord, field: &str) -> bool {
    let local_ts = local.state.get(field).copied().unwrap_or(0);
    let incoming_ts = incoming.state.get(field).copied().unwrap_or(0);
    if incoming_ts != local_ts {
        return incoming_ts > local_ts;
    }
    let local_writer = local.field_writer(field);
    let incoming_writer = incoming.field_writer(field);
    if incoming_writer != local_writer {
        return incoming_writer > local_writer;
    }
    value_rank(incoming.data.get(field)) >= value_rank(local.data.get(field))
}

/// Content-determined total order over field values.
fn value_rank(value: Option<&JsonValue>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_default()
}

/// Content-determined rank over the record-level attributes that follow
/// the newer record, so exact ties still resolve identically everywhere.
fn record_payload_rank(record: &NodeRecord) -> String {
    serde_json::to_string(&(&record.vector, &record.node_type))
        .unwrap_or_default()
}

/// A field only `holder` carries survives unless the other side proves it
/// knew the field and superseded it: kept when the other side's state has
/// no entry for it, or when the holder's write is newer than everything
/// the other side has seen.
fn keep_one_sided(holder: &NodeRecord, other: &NodeRecord, field: &str) -> bool {
    match other.state.get(field) {
        None => true,
        Some(_) => holder.state.get(field).copied().unwrap_or(0) > other.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn put(
        peer: &str,
        timestamp: TimestampMs,
        data: serde_json::Value,
    ) -> NodeRecord {
        let JsonValue::Object(fields) = data else {
            panic!("test data must be an object");
        };
        let mut clock = VectorClock::new();
        clock.increment(peer);
        NodeRecord::local_write("k".to_string(), fields, None, None, timestamp, clock, peer)
    }

    #[test]
    fn vector_clock_increment_and_merge() {
        let mut a = VectorClock::new();
        assert_eq!(a.increment("A"), 1);
        assert_eq!(a.increment("A"), 2);

        let mut b = VectorClock::new();
        b.increment("B");

        a.merge(&b);
        assert_eq!(a.get("A"), 2);
        assert_eq!(a.get("B"), 1);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn merge_with_absent_local_returns_incoming() {
        let incoming = put("A", 100, json!({"x": 1}));
        let merged = NodeRecord::merge(None, &incoming);
        assert_eq!(merged, incoming);
    }

    #[test]
    fn disjoint_fields_union() {
        // Two peers write different fields; the union survives with each
        // field keeping its own write timestamp.
        let a = put("A", 100, json!({"x": 1}));
        let b = put("B", 200, json!({"y": 2}));

        let merged = NodeRecord::merge(Some(&a), &b);
        assert_eq!(merged.data.get("x"), Some(&json!(1)));
        assert_eq!(merged.data.get("y"), Some(&json!(2)));
        assert_eq!(merged.state["x"], 100);
        assert_eq!(merged.state["y"], 200);
        assert_eq!(merged.timestamp, 200);
        assert_eq!(merged.vector_clock.get("A"), 1);
        assert_eq!(merged.vector_clock.get("B"), 1);
    }

    #[test]
    fn newer_write_wins_conflicting_field() {
        let a = put("A", 1000, json!({"v": "from-A"}));
        let b = put("B", 1001, json!({"v": "from-B"}));

        let merged = NodeRecord::merge(Some(&a), &b);
        assert_eq!(merged.data["v"], json!("from-B"));
        assert_eq!(merged.state["v"], 1001);
        assert_eq!(merged.timestamp, 1001);

        // Same result with the sides swapped.
        let flipped = NodeRecord::merge(Some(&b), &a);
        assert_eq!(flipped, merged);
    }

    #[test]
    fn equal_timestamps_larger_writer_wins() {
        let a = put("A", 2000, json!({"v": "A"}));
        let b = put("B", 2000, json!({"v": "B"}));

        let merged = NodeRecord::merge(Some(&a), &b);
        assert_eq!(merged.data["v"], json!("B"));
        assert_eq!(merged.vector_clock.get("A"), 1);
        assert_eq!(merged.vector_clock.get("B"), 1);

        let flipped = NodeRecord::merge(Some(&b), &a);
        assert_eq!(flipped, merged);
    }

    #[test]
    fn field_tie_break_survives_unrelated_newer_write() {
        // A third peer's later write of another field must not change the
        // outcome of a tie on "f", whichever order the records arrive in.
        let a = put("A", 5, json!({"f": "from-A"}));
        let b = put("B", 5, json!({"f": "from-B"}));
        let z = put("Z", 9, json!({"g": "later"}));

        let one = NodeRecord::merge(Some(&NodeRecord::merge(Some(&a), &z)), &b);
        let two = NodeRecord::merge(Some(&NodeRecord::merge(Some(&a), &b)), &z);
        assert_eq!(one, two);
        assert_eq!(one.data["f"], json!("from-B"));
        assert_eq!(one.data["g"], json!("later"));
    }

    #[test]
    fn same_writer_same_instant_resolves_by_value() {
        // Two writes from one peer inside the same millisecond carry the
        // same writer and per-field timestamp; the value order decides,
        // identically on every peer.
        let first = put("A", 7, json!({"v": "aaa"}));
        let second = put("A", 7, json!({"v": "zzz"}));

        let one = NodeRecord::merge(Some(&first), &second);
        let two = NodeRecord::merge(Some(&second), &first);
        assert_eq!(one, two);
        assert_eq!(one.data["v"], json!("zzz"));
    }

    #[test]
    fn one_sided_field_is_kept() {
        let a = put("A", 100, json!({"x": 1, "y": 2}));
        let b = put("B", 200, json!({"x": 3}));

        let merged = NodeRecord::merge(Some(&a), &b);
        assert_eq!(merged.data["x"], json!(3));
        assert_eq!(merged.data["y"], json!(2));
        assert_eq!(merged.state["y"], 100);
    }

    #[test]
    fn vector_and_type_follow_newer_record() {
        let mut a = put("A", 100, json!({"x": 1}));
        a.vector = Some(vec![1.0, 0.0]);
        a.node_type = Some("note".to_string());

        let mut b = put("B", 200, json!({"y": 2}));
        b.vector = Some(vec![0.0, 1.0]);
        b.node_type = Some("task".to_string());

        let merged = NodeRecord::merge(Some(&a), &b);
        assert_eq!(merged.vector, Some(vec![0.0, 1.0]));
        assert_eq!(merged.node_type, Some("task".to_string()));

        // Older incoming record does not displace vector or type.
        let merged = NodeRecord::merge(Some(&b), &a);
        assert_eq!(merged.vector, Some(vec![0.0, 1.0]));
        assert_eq!(merged.node_type, Some("task".to_string()));
    }

    #[test]
    fn merged_clock_dominates_both_inputs() {
        let mut a = put("A", 100, json!({"x": 1}));
        a.vector_clock.increment("A");
        let b = put("B", 200, json!({"y": 2}));

        let merged = NodeRecord::merge(Some(&a), &b);
        assert!(merged.vector_clock.dominates(&a.vector_clock));
        assert!(merged.vector_clock.dominates(&b.vector_clock));
    }

    #[test]
    fn wire_attribute_names() {
        let mut record = put("A", 42, json!({"x": 1}));
        record.node_type = Some("note".to_string());
        record.vector = Some(vec![0.5]);

        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["id"], json!("k"));
        assert_eq!(encoded["type"], json!("note"));
        assert_eq!(encoded["timestamp"], json!(42));
        assert_eq!(encoded["state"]["x"], json!(42));
        assert_eq!(encoded["vectorClock"]["A"], json!(1));
        assert_eq!(encoded["writerId"], json!("A"));

        let decoded: NodeRecord = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn unknown_top_level_attributes_are_ignored() {
        let decoded: NodeRecord = serde_json::from_value(json!({
            "id": "k",
            "data": {"x": 1, "custom": {"nested": true}},
            "timestamp": 7,
            "state": {"x": 7},
            "vectorClock": {"A": 1},
            "futureAttribute": "ignored"
        }))
        .unwrap();
        assert_eq!(decoded.id, "k");
        // Payload contents survive untouched, including fields this
        // version knows nothing about.
        assert_eq!(decoded.data["custom"], json!({"nested": true}));
    }

    // -----------------------------------------------------------------------
    // Merge laws
    // -----------------------------------------------------------------------

    fn arbitrary_put() -> impl Strategy<Value = NodeRecord> {
        let field = prop::sample::select(vec!["f", "g", "h"]);
        let fields = prop::collection::btree_map(field, 0i64..4, 1..3);
        (
            prop::sample::select(vec!["A", "B", "C", "D"]),
            0i64..4,
            fields,
        )
            .prop_map(|(peer, timestamp, fields)| {
                let data: serde_json::Value = serde_json::Value::Object(
                    fields
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), json!(v)))
                        .collect(),
                );
                put(peer, timestamp, data)
            })
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(
            base in prop::collection::vec(arbitrary_put(), 0..3),
            incoming in arbitrary_put(),
        ) {
            let local = base
                .iter()
                .fold(None, |acc: Option<NodeRecord>, record| {
                    Some(NodeRecord::merge(acc.as_ref(), record))
                });
            let once = NodeRecord::merge(local.as_ref(), &incoming);
            let twice = NodeRecord::merge(Some(&once), &incoming);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn merge_order_does_not_matter(
            mut puts in prop::collection::vec(arbitrary_put(), 1..5),
            seed in any::<u64>(),
        ) {
            let folded = |records: &[NodeRecord]| {
                records.iter().fold(None, |acc: Option<NodeRecord>, record| {
                    Some(NodeRecord::merge(acc.as_ref(), record))
                })
            };
            let reference = folded(&puts);

            // Deterministic shuffle driven by the seed.
            let mut state = seed;
            for i in (1..puts.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let j = (state >> 33) as usize % (i + 1);
                puts.swap(i, j);
            }
            let shuffled = folded(&puts);
            prop_assert_eq!(reference, shuffled);
        }
    }
}
