//! Policy-driven server selection.
//!
//! A policy narrows the catalog with equality joins over the attribute
//! indexes, spreads the picks across the values of one attribute, and
//! finally samples through quota-bounded set rules. The selector is what
//! object generation uses to place new metadata and datafile objects.

use std::fmt;
use std::sync::Arc;

use log::debug;
use rand::RngCore;

use super::{SID_NUM_ATTR, ServerRecord, SidCache};
use crate::error::{Error, Result};
use crate::types::{FsId, ObjectRef, Oid, Sid};

/// Comparison operators the set-rule expressions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less or equal.
    Le,
}

impl CmpOp {
    /// Apply the operator.
    pub fn eval(self, lhs: i32, rhs: i32) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
        }
    }
}

/// One equality predicate for the cursor join.
#[derive(Debug, Clone, Copy)]
pub struct JoinCriterion {
    /// Attribute index.
    pub attr: usize,
    /// Required value.
    pub value: i32,
}

/// Boolean test over a record's attributes.
pub type SetPredicate = Arc<dyn Fn(&ServerRecord) -> bool + Send + Sync>;

/// A quota-bounded selection rule.
#[derive(Clone)]
pub struct SetCriterion {
    /// Most servers this rule may contribute.
    pub count_max: usize,
    /// The rule's predicate.
    pub pred: SetPredicate,
}

impl fmt::Debug for SetCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetCriterion")
            .field("count_max", &self.count_max)
            .finish()
    }
}

impl SetCriterion {
    /// Rule admitting up to `count_max` of any server.
    pub fn any(count_max: usize) -> SetCriterion {
        SetCriterion {
            count_max,
            pred: Arc::new(|_| true),
        }
    }

    /// Rule comparing one attribute against a constant.
    pub fn attr_cmp(count_max: usize, attr: usize, op: CmpOp, value: i32) -> SetCriterion {
        SetCriterion {
            count_max,
            pred: Arc::new(move |rec| {
                attr < SID_NUM_ATTR && op.eval(rec.attrs[attr], value)
            }),
        }
    }
}

/// Which installed policy to select with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyTag {
    /// Placement for metadata objects.
    Meta,
    /// Placement for datafile objects.
    Data,
}

/// A complete selection policy.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Equality predicates every candidate must satisfy.
    pub join: Vec<JoinCriterion>,
    /// Attribute whose values the picks should spread across.
    pub spread_attr: Option<usize>,
    /// Quota-bounded rules applied to the candidates in order.
    pub set: Vec<SetCriterion>,
    /// Replica count for objects placed under this policy.
    pub copies: usize,
}

impl Policy {
    /// Permissive metadata policy: any server, two copies.
    pub fn default_meta() -> Policy {
        Policy {
            join: Vec::new(),
            spread_attr: None,
            set: vec![SetCriterion::any(usize::MAX)],
            copies: 2,
        }
    }

    /// Permissive datafile policy: any server, two copies.
    pub fn default_data() -> Policy {
        Policy {
            join: Vec::new(),
            spread_attr: None,
            set: vec![SetCriterion::any(usize::MAX)],
            copies: 2,
        }
    }
}

/// Select up to `want_n` servers under `policy`. Returns the chosen
/// records and the policy's replica count; the list is shorter than
/// `want_n` when the catalog cannot satisfy it.
pub fn select_servers(
    cache: &SidCache,
    policy: &Policy,
    want_n: usize,
) -> Result<(Vec<ServerRecord>, usize)> {
    // join phase: intersect the attribute indexes
    let candidates: Vec<ServerRecord> = if policy.join.is_empty() {
        cache.all_records()?
    } else {
        let mut sets = Vec::with_capacity(policy.join.len());
        for jc in &policy.join {
            sets.push(cache.sids_with_attr(jc.attr, jc.value)?);
        }
        // each set is ascending; walk the smallest and test membership
        sets.sort_by_key(|s| s.len());
        let (first, rest) = sets.split_first().ok_or(Error::Internal("join sets empty"))?;
        let mut joined = Vec::new();
        for sid in first {
            if rest.iter().all(|s| s.binary_search(sid).is_ok()) {
                joined.push(cache.get(sid)?);
            }
        }
        joined
    };
    debug!(
        "select_servers: {} candidates after join ({} criteria)",
        candidates.len(),
        policy.join.len()
    );

    // spread phase: reorder so distinct values of the spread attribute
    // come first, round-robin across value groups
    let ordered = match policy.spread_attr {
        Some(attr) if attr < SID_NUM_ATTR => {
            let mut groups: Vec<(i32, Vec<ServerRecord>)> = Vec::new();
            for rec in candidates {
                let value = rec.attrs[attr];
                match groups.iter_mut().find(|(v, _)| *v == value) {
                    Some((_, g)) => g.push(rec),
                    None => groups.push((value, vec![rec])),
                }
            }
            let mut ordered = Vec::new();
            let mut depth = 0;
            loop {
                let mut took = false;
                for (_, g) in &groups {
                    if let Some(rec) = g.get(depth) {
                        ordered.push(rec.clone());
                        took = true;
                    }
                }
                if !took {
                    break;
                }
                depth += 1;
            }
            ordered
        }
        _ => candidates,
    };

    // set phase: each rule contributes up to its quota
    let mut picked = Vec::new();
    if policy.set.is_empty() {
        picked.extend(ordered.into_iter().take(want_n));
    } else {
        let mut used: Vec<usize> = vec![0; policy.set.len()];
        for rec in ordered {
            if picked.len() >= want_n {
                break;
            }
            for (i, rule) in policy.set.iter().enumerate() {
                if used[i] < rule.count_max && (rule.pred)(&rec) {
                    used[i] += 1;
                    picked.push(rec);
                    break;
                }
            }
        }
    }

    debug!("select_servers: picked {} of {want_n} wanted", picked.len());
    Ok((picked, policy.copies))
}

/// A newly generated object and the servers chosen to hold it.
#[derive(Debug, Clone)]
pub struct NewObject {
    /// The fresh object reference.
    pub refn: ObjectRef,
    /// Servers holding the object's copies.
    pub sids: Vec<Sid>,
}

fn fresh_oid() -> Oid {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    Oid(bytes)
}

fn gen_objects(
    cache: &SidCache,
    tag: PolicyTag,
    count: usize,
    fs_id: FsId,
) -> Result<Vec<NewObject>> {
    let policy = cache.policy(tag);
    let want = count.saturating_mul(policy.copies).max(policy.copies);
    let (servers, copies) = select_servers(cache, &policy, want)?;
    if servers.is_empty() {
        return Err(Error::PolicyUnsatisfied);
    }
    let copies = copies.min(servers.len());

    // deal the selected servers round-robin into each object's copy set
    let mut next = 0usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let mut sids = Vec::with_capacity(copies);
        for _ in 0..copies {
            sids.push(servers[next % servers.len()].sid);
            next += 1;
        }
        out.push(NewObject {
            refn: ObjectRef::new(fs_id, fresh_oid()),
            sids,
        });
    }
    Ok(out)
}

impl SidCache {
    /// Generate `count` new metadata objects placed under the meta policy.
    pub fn gen_meta(&self, count: usize, fs_id: FsId) -> Result<Vec<NewObject>> {
        gen_objects(self, PolicyTag::Meta, count, fs_id)
    }

    /// Generate `count` new datafile objects placed under the data policy.
    pub fn gen_data(&self, count: usize, fs_id: FsId) -> Result<Vec<NewObject>> {
        gen_objects(self, PolicyTag::Data, count, fs_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sid::{ServerTypes, attr_index};

    fn sid(n: u8) -> Sid {
        Sid([n; 16])
    }

    fn add_server(cache: &SidCache, n: u8, rack: i32) {
        let mut rec = ServerRecord::new(sid(n), &format!("tcp://node{n}:3334"));
        rec.attrs[attr_index("rack").expect("known attribute")] = rack;
        cache.add(&rec, ServerTypes::META | ServerTypes::DATA).unwrap();
    }

    fn rack() -> usize {
        attr_index("rack").expect("known attribute")
    }

    #[test]
    fn empty_join_with_quota_caps_result() {
        let cache = SidCache::new();
        for n in 0..5 {
            add_server(&cache, n, 1);
        }
        let policy = Policy {
            join: Vec::new(),
            spread_attr: None,
            set: vec![SetCriterion::any(3)],
            copies: 1,
        };
        let (picked, _) = select_servers(&cache, &policy, 10).unwrap();
        assert_eq!(picked.len(), 3);

        let (picked, _) = select_servers(&cache, &policy, 2).unwrap();
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn join_criteria_filter_all_results() {
        let cache = SidCache::new();
        for n in 0..3 {
            add_server(&cache, n, 1);
        }
        for n in 3..5 {
            add_server(&cache, n, 2);
        }
        let policy = Policy {
            join: vec![JoinCriterion {
                attr: rack(),
                value: 2,
            }],
            spread_attr: None,
            set: vec![SetCriterion::any(usize::MAX)],
            copies: 1,
        };
        let (picked, _) = select_servers(&cache, &policy, 10).unwrap();
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|r| r.attrs[rack()] == 2));
    }

    #[test]
    fn multi_join_intersects() {
        let cache = SidCache::new();
        let zone = attr_index("zone").expect("known attribute");
        for n in 0..4u8 {
            let mut rec = ServerRecord::new(sid(n), "tcp://x:1");
            rec.attrs[rack()] = (n % 2) as i32;
            rec.attrs[zone] = (n / 2) as i32;
            cache.add(&rec, ServerTypes::empty()).unwrap();
        }
        let policy = Policy {
            join: vec![
                JoinCriterion { attr: rack(), value: 1 },
                JoinCriterion { attr: zone, value: 1 },
            ],
            spread_attr: None,
            set: vec![SetCriterion::any(usize::MAX)],
            copies: 1,
        };
        let (picked, _) = select_servers(&cache, &policy, 10).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].sid, sid(3));
    }

    #[test]
    fn spread_attr_varies_values_first() {
        let cache = SidCache::new();
        add_server(&cache, 1, 1);
        add_server(&cache, 2, 1);
        add_server(&cache, 3, 2);
        add_server(&cache, 4, 3);
        let policy = Policy {
            join: Vec::new(),
            spread_attr: Some(rack()),
            set: vec![SetCriterion::any(usize::MAX)],
            copies: 1,
        };
        let (picked, _) = select_servers(&cache, &policy, 3).unwrap();
        let racks: Vec<i32> = picked.iter().map(|r| r.attrs[rack()]).collect();
        let mut distinct = racks.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3, "three picks should cover three racks: {racks:?}");
    }

    #[test]
    fn set_rule_quotas_bound_contributions() {
        let cache = SidCache::new();
        for n in 0..4 {
            add_server(&cache, n, 1);
        }
        add_server(&cache, 9, 5);
        // rule 1: at most one rack-1 server; rule 2: anything else
        let policy = Policy {
            join: Vec::new(),
            spread_attr: None,
            set: vec![
                SetCriterion::attr_cmp(1, rack(), CmpOp::Eq, 1),
                SetCriterion::attr_cmp(usize::MAX, rack(), CmpOp::Ne, 1),
            ],
            copies: 1,
        };
        let (picked, _) = select_servers(&cache, &policy, 10).unwrap();
        let rack1 = picked.iter().filter(|r| r.attrs[rack()] == 1).count();
        assert_eq!(rack1, 1);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn gen_meta_assigns_copies_round_robin() {
        let cache = SidCache::new();
        for n in 0..4 {
            add_server(&cache, n, 1);
        }
        cache.set_policy(
            PolicyTag::Meta,
            Policy {
                join: Vec::new(),
                spread_attr: None,
                set: vec![SetCriterion::any(usize::MAX)],
                copies: 2,
            },
        );
        let objs = cache.gen_meta(3, FsId(5)).unwrap();
        assert_eq!(objs.len(), 3);
        for obj in &objs {
            assert_eq!(obj.refn.fs_id, FsId(5));
            assert!(!obj.refn.oid.is_null());
            assert_eq!(obj.sids.len(), 2);
            assert_ne!(obj.sids[0], obj.sids[1]);
        }
        // fresh oids must be unique
        assert_ne!(objs[0].refn.oid, objs[1].refn.oid);
    }

    #[test]
    fn gen_data_fails_on_empty_catalog() {
        let cache = SidCache::new();
        assert!(matches!(
            cache.gen_data(1, FsId(1)),
            Err(Error::PolicyUnsatisfied)
        ));
    }
}
