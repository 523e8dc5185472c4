//! Server catalog and policy selection scenarios.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};

use parafs::sid::{
    JoinCriterion, Policy, ServerRecord, ServerTypes, SetCriterion, SidCache, attr_index, load,
    save, select_servers,
};
use parafs::types::Sid;

fn sid(n: u8) -> Sid {
    Sid([n; 16])
}

fn rack() -> usize {
    attr_index("rack").expect("rack is a known attribute")
}

fn server(n: u8, rack_no: i32) -> ServerRecord {
    let mut rec = ServerRecord::new(sid(n), &format!("tcp://node{n}.cluster:3334"));
    rec.attrs[rack()] = rack_no;
    rec.alias = Some(format!("node{n}"));
    rec
}

#[test]
fn save_then_load_preserves_the_catalog() {
    let cache = SidCache::new();
    for n in [5u8, 2, 9, 1] {
        cache
            .add(&server(n, (n % 3) as i32), ServerTypes::META | ServerTypes::DATA)
            .expect("add");
    }

    let mut file = tempfile::tempfile().expect("temp file");
    save(&cache, &mut file).expect("save");
    file.seek(SeekFrom::Start(0)).expect("rewind");

    let reloaded = SidCache::new();
    let added = load(&reloaded, BufReader::new(file)).expect("load");
    assert_eq!(added, 4);
    assert_eq!(
        reloaded.all_records().expect("records"),
        cache.all_records().expect("records")
    );
    for n in [5u8, 2, 9, 1] {
        assert_eq!(
            reloaded.types_of(&sid(n)).expect("types"),
            ServerTypes::META | ServerTypes::DATA
        );
    }
}

#[test]
fn load_from_a_config_file_on_disk() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("servers.conf");
    std::fs::write(
        &path,
        format!(
            "<ServerDefines>\n\
             \t<ServerDef>\n\
             \t\tSID {}\n\
             \t\tAddress tcp://only.cluster:3334\n\
             \t\tAttributes rack=7\n\
             \t\tType DATA\n\
             \t</ServerDef>\n\
             </ServerDefines>\n",
            sid(7)
        ),
    )
    .expect("write config");

    let cache = SidCache::new();
    let added = load(&cache, BufReader::new(File::open(&path).expect("open"))).expect("load");
    assert_eq!(added, 1);
    let rec = cache.get(&sid(7)).expect("record");
    assert_eq!(rec.attrs[rack()], 7);
}

#[test]
fn rack_policy_selects_four_of_five() {
    // catalog: three servers in rack 1, two in rack 2
    let cache = SidCache::new();
    for n in 1..=3u8 {
        cache.add(&server(n, 1), ServerTypes::DATA).expect("add");
    }
    for n in 4..=5u8 {
        cache.add(&server(n, 2), ServerTypes::DATA).expect("add");
    }

    // any racked server, at most four picks
    let policy = Policy {
        join: Vec::new(),
        spread_attr: None,
        set: vec![SetCriterion::any(4)],
        copies: 1,
    };
    let (picked, copies) = select_servers(&cache, &policy, 10).expect("select");
    assert_eq!(picked.len(), 4);
    assert_eq!(copies, 1);
}

#[test]
fn join_criteria_are_never_violated() {
    let cache = SidCache::new();
    for n in 1..=6u8 {
        cache.add(&server(n, (n % 2) as i32 + 1), ServerTypes::DATA).expect("add");
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
    let (picked, _) = select_servers(&cache, &policy, 100).expect("select");
    assert!(!picked.is_empty());
    assert!(picked.iter().all(|rec| rec.attrs[rack()] == 2));
}

#[test]
fn selector_honors_want_n_against_small_catalogs() {
    let cache = SidCache::new();
    for n in 1..=3u8 {
        cache.add(&server(n, 1), ServerTypes::DATA).expect("add");
    }
    let policy = Policy {
        join: Vec::new(),
        spread_attr: None,
        set: vec![SetCriterion::any(usize::MAX)],
        copies: 1,
    };
    let (picked, _) = select_servers(&cache, &policy, 8).expect("select");
    assert_eq!(picked.len(), 3, "catalog smaller than the ask");
}
