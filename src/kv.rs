//! `LargeScaleKV` / `ValueBlock` — the sparse key/value block (spec.md §3,
//! §4.B), ported from the original `large_scale_kv.h`'s `VALUE`/`ValueBlock`
//! and `entry<int>`/`entry<float>` admission predicates.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;

use crate::error::{CommError, CommResult};

/// How a key's vectors are initialized on first insert.
#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    Constant(f32),
    Uniform(f32, f32),
    Normal(f32, f32),
    Fill(f32),
}

impl Initializer {
    /// Parses `constant:<v>` | `uniform:<min>,<max>` | `normal:<mean>,<std>`
    /// | `fill:<v>`, the grammar `large_scale_kv.h`'s constructor wires up
    /// per value-slot.
    pub fn parse(spec: &str) -> CommResult<Self> {
        let bad = || CommError::Config(format!("malformed initializer spec `{spec}`"));
        let (kind, rest) = spec.split_once(':').ok_or_else(bad)?;
        match kind {
            "constant" => Ok(Initializer::Constant(rest.parse().map_err(|_| bad())?)),
            "fill" => Ok(Initializer::Fill(rest.parse().map_err(|_| bad())?)),
            "uniform" => {
                let (a, b) = rest.split_once(',').ok_or_else(bad)?;
                Ok(Initializer::Uniform(a.parse().map_err(|_| bad())?, b.parse().map_err(|_| bad())?))
            }
            "normal" => {
                let (a, b) = rest.split_once(',').ok_or_else(bad)?;
                Ok(Initializer::Normal(a.parse().map_err(|_| bad())?, b.parse().map_err(|_| bad())?))
            }
            _ => Err(bad()),
        }
    }

    pub fn fill(&self, width: usize) -> Vec<f32> {
        match self {
            Initializer::Constant(v) | Initializer::Fill(v) => vec![*v; width],
            Initializer::Uniform(lo, hi) => {
                let mut rng = rand::thread_rng();
                (0..width).map(|_| rng.gen_range(*lo..*hi)).collect()
            }
            Initializer::Normal(mean, std) => {
                // Box-Muller transform; avoids pulling in a distributions crate
                // for a single-call-site use.
                let mut rng = rand::thread_rng();
                (0..width)
                    .map(|_| {
                        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                        let u2: f32 = rng.gen_range(0.0..1.0);
                        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
                        mean + std * z
                    })
                    .collect()
            }
        }
    }
}

/// Admission predicate deciding whether a sparse key participates in
/// gradient updates.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    None,
    CountFilter(u64),
    Probability(f32),
}

impl Admission {
    /// Parses `none` | `count_filter&<T>` | `probability&<p>`.
    pub fn parse(spec: &str) -> CommResult<Self> {
        if spec == "none" {
            return Ok(Admission::None);
        }
        let (kind, rest) = spec
            .split_once('&')
            .ok_or_else(|| CommError::Config(format!("malformed admission spec `{spec}`")))?;
        match kind {
            "count_filter" => Ok(Admission::CountFilter(
                rest.parse().map_err(|_| CommError::Config("bad count_filter threshold".into()))?,
            )),
            "probability" => Ok(Admission::Probability(
                rest.parse().map_err(|_| CommError::Config("bad probability threshold".into()))?,
            )),
            _ => Err(CommError::Config(format!("unknown admission kind `{kind}`"))),
        }
    }

    fn evaluate(&self, count: u64) -> bool {
        match self {
            Admission::None => true,
            Admission::CountFilter(threshold) => count >= *threshold,
            Admission::Probability(p) => rand::thread_rng().gen::<f32>() >= *p,
        }
    }
}

/// Per-key bookkeeping plus its parallel list of named per-key dense
/// vectors, whose widths come from the schema.
#[derive(Debug, Clone)]
pub struct Entry {
    pub count: u64,
    pub unseen_days: u32,
    pub seen_after_last_save: bool,
    pub is_admitted: bool,
    values: Vec<Vec<f32>>,
}

impl Entry {
    fn fetch_count(&mut self) -> u64 {
        self.count += 1;
        self.count
    }
}

/// `(slot_name, width)` plus per-slot initializer, the schema a
/// `ValueBlock` is constructed with.
#[derive(Debug, Clone)]
pub struct Schema {
    slots: Vec<(String, usize)>,
    initializers: HashMap<String, Initializer>,
    places: HashMap<String, usize>,
}

impl Schema {
    pub fn new(slots: Vec<(String, usize, Initializer)>) -> Self {
        let mut places = HashMap::new();
        let mut initializers = HashMap::new();
        let mut plain_slots = Vec::with_capacity(slots.len());
        for (idx, (name, width, init)) in slots.into_iter().enumerate() {
            places.insert(name.clone(), idx);
            initializers.insert(name.clone(), init);
            plain_slots.push((name, width));
        }
        Schema { slots: plain_slots, initializers, places }
    }

    fn slot_names(&self) -> Vec<&str> {
        self.slots.iter().map(|(n, _)| n.as_str()).collect()
    }
}

/// A sparse key → `Entry` store with admission policy, the "large-scale
/// key/value block" spec.md §1 names. Readers use a shared read-lock;
/// Init/Set/Update take the exclusive lock — spec.md §9's copy-out design
/// note (b), not raw pointers into the vectors.
pub struct ValueBlock {
    schema: Schema,
    admission: Admission,
    entries: RwLock<HashMap<u64, Entry>>,
}

impl ValueBlock {
    pub fn new(schema: Schema, admission: Admission) -> Self {
        ValueBlock { schema, admission, entries: RwLock::new(HashMap::new()) }
    }

    fn fresh_entry(&self, count: u64, unseen_days: u32, seen_after_last_save: bool) -> Entry {
        let values = self
            .schema
            .slots
            .iter()
            .map(|(name, width)| self.schema.initializers[name].fill(*width))
            .collect();
        Entry { count, unseen_days, seen_after_last_save, is_admitted: matches!(self.admission, Admission::None), values }
    }

    /// Inserts each of `keys` with a fresh entry. Fails with
    /// `CommError::AlreadyExists` if any key is already present.
    pub fn init(&self, keys: &[u64]) -> CommResult<()> {
        let mut entries = self.entries.write();
        for &key in keys {
            if entries.contains_key(&key) {
                return Err(CommError::AlreadyExists(key.to_string()));
            }
        }
        for &key in keys {
            entries.insert(key, self.fresh_entry(1, 0, true));
        }
        Ok(())
    }

    /// If `key` is present and admission is enabled, re-consults `Update`;
    /// otherwise behaves like `Init([key])`.
    pub fn init_from_initializer(&self, key: u64) -> CommResult<()> {
        let already_present = self.entries.read().contains_key(&key);
        if already_present {
            if !matches!(self.admission, Admission::None) {
                self.update(key)?;
            }
            return Ok(());
        }
        self.init(&[key])
    }

    /// Looks up each key's requested slots, in `keys` order. Fails with
    /// `CommError::NotFound` on any missing key.
    pub fn get(&self, keys: &[u64], slot_names: &[&str]) -> CommResult<Vec<Vec<Vec<f32>>>> {
        let entries = self.entries.read();
        keys.iter()
            .map(|key| {
                let entry = entries
                    .get(key)
                    .ok_or_else(|| CommError::NotFound(key.to_string()))?;
                slot_names
                    .iter()
                    .map(|name| {
                        let idx = *self
                            .schema
                            .places
                            .get(*name)
                            .ok_or_else(|| CommError::ContractViolation(format!("unknown slot `{name}`")))?;
                        Ok(entry.values[idx].clone())
                    })
                    .collect()
            })
            .collect()
    }

    /// Fetches every configured slot for `key`, in schema order.
    pub fn get_all(&self, key: u64) -> CommResult<Vec<Vec<f32>>> {
        self.get(&[key], &self.schema.slot_names()).map(|mut v| v.remove(0))
    }

    /// Overwrites `key`'s named slots with `values`.
    pub fn set(&self, key: u64, slot_names: &[&str], values: &[Vec<f32>]) -> CommResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| CommError::NotFound(key.to_string()))?;
        for (name, value) in slot_names.iter().zip(values) {
            let idx = *self
                .schema
                .places
                .get(*name)
                .ok_or_else(|| CommError::ContractViolation(format!("unknown slot `{name}`")))?;
            entry.values[idx] = value.clone();
        }
        Ok(())
    }

    /// `unseen_days = 0`, `count += 1`; if not yet admitted, re-consults
    /// the admission predicate on the new count. Sticky: once admitted,
    /// stays admitted.
    pub fn update(&self, key: u64) -> CommResult<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| CommError::NotFound(key.to_string()))?;
        entry.unseen_days = 0;
        let count = entry.fetch_count();
        if !entry.is_admitted {
            entry.is_admitted = self.admission.evaluate(count);
        }
        Ok(())
    }

    pub fn get_entry(&self, key: u64) -> CommResult<bool> {
        let entries = self.entries.read();
        entries
            .get(&key)
            .map(|e| e.is_admitted)
            .ok_or_else(|| CommError::NotFound(key.to_string()))
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.read().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            ("Param".into(), 2, Initializer::Constant(0.0)),
            ("Moment1".into(), 2, Initializer::Constant(0.0)),
        ])
    }

    #[test]
    fn init_twice_is_already_exists() {
        let vb = ValueBlock::new(schema(), Admission::None);
        vb.init(&[1]).unwrap();
        let err = vb.init(&[1]).unwrap_err();
        assert!(matches!(err, CommError::AlreadyExists(_)));
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let vb = ValueBlock::new(schema(), Admission::None);
        let err = vb.get(&[42], &["Param"]).unwrap_err();
        assert!(matches!(err, CommError::NotFound(_)));
    }

    #[test]
    fn set_then_get_roundtrips() {
        let vb = ValueBlock::new(schema(), Admission::None);
        vb.init(&[7]).unwrap();
        vb.set(7, &["Param"], &[vec![1.0, 2.0]]).unwrap();
        let got = vb.get(&[7], &["Param"]).unwrap();
        assert_eq!(got, vec![vec![vec![1.0, 2.0]]]);
    }

    #[test]
    fn admission_none_is_always_admitted() {
        let vb = ValueBlock::new(schema(), Admission::None);
        vb.init(&[1]).unwrap();
        assert!(vb.get_entry(1).unwrap());
    }

    #[test]
    fn count_filter_admission_is_sticky() {
        // S5: threshold=2, InitFromInitializer(7) three times.
        let vb = ValueBlock::new(schema(), Admission::CountFilter(2));
        vb.init_from_initializer(7).unwrap();
        assert!(!vb.get_entry(7).unwrap());

        vb.init_from_initializer(7).unwrap();
        assert!(vb.get_entry(7).unwrap());

        vb.init_from_initializer(7).unwrap();
        assert!(vb.get_entry(7).unwrap());
    }

    #[test]
    fn update_resets_unseen_days_and_increments_count() {
        let vb = ValueBlock::new(schema(), Admission::None);
        vb.init(&[1]).unwrap();
        vb.update(1).unwrap();
        let entries = vb.entries.read();
        let e = entries.get(&1).unwrap();
        assert_eq!(e.count, 2);
        assert_eq!(e.unseen_days, 0);
    }

    #[test]
    fn initializer_parse_roundtrip() {
        assert_eq!(Initializer::parse("constant:1.5").unwrap(), Initializer::Constant(1.5));
        assert_eq!(Initializer::parse("uniform:-1,1").unwrap(), Initializer::Uniform(-1.0, 1.0));
        assert_eq!(Initializer::parse("normal:0,1").unwrap(), Initializer::Normal(0.0, 1.0));
        assert_eq!(Initializer::parse("fill:0").unwrap(), Initializer::Fill(0.0));
        assert!(Initializer::parse("bogus").is_err());
    }
}
