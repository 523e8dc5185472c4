//! Server definition text format.
//!
//! Catalogs load from and save to a line-oriented block format:
//!
//! ```text
//! <ServerDefines>
//!     <ServerDef>
//!         Alias node-a
//!         SID 00010203-0405-0607-0809-0a0b0c0d0e0f
//!         Address tcp://node-a:3334
//!         Attributes rack=1 zone=2
//!         Type META DATA
//!     </ServerDef>
//! </ServerDefines>
//! ```
//!
//! Unknown attribute names are discarded quietly; an unknown type word
//! aborts that server's definition. A SID already in the catalog keeps its
//! first definition.

use std::io::{BufRead, Write};

use log::{debug, warn};

use super::{ServerRecord, ServerTypes, SidCache, attr_index};
use crate::error::{Error, Result};
use crate::types::Sid;

#[derive(Default)]
struct PartialDef {
    alias: Option<String>,
    sid: Option<Sid>,
    address: Option<String>,
    attrs: Vec<(usize, i32)>,
    types: ServerTypes,
    bad_type: bool,
}

/// Load server definitions from `input` into `cache`. Returns the number
/// of servers added.
pub fn load<R: BufRead>(cache: &SidCache, input: R) -> Result<usize> {
    let mut added = 0usize;
    let mut current: Option<PartialDef> = None;
    let mut seen_wrapper = false;

    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "<ServerDefines>" => {
                seen_wrapper = true;
                continue;
            }
            "</ServerDefines>" => break,
            "<ServerDef>" => {
                current = Some(PartialDef::default());
                continue;
            }
            "</ServerDef>" => {
                if let Some(def) = current.take() {
                    if finish_def(cache, def)? {
                        added += 1;
                    }
                }
                continue;
            }
            _ => {}
        }

        let Some(def) = current.as_mut() else {
            warn!("server definitions: stray line outside a block: {line}");
            continue;
        };
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (line, ""),
        };
        match keyword {
            "Alias" => def.alias = Some(rest.to_string()),
            "SID" => match rest.parse::<Sid>() {
                Ok(sid) => def.sid = Some(sid),
                Err(_) => {
                    warn!("server definitions: unparseable SID {rest:?}, skipping server");
                    def.bad_type = true;
                }
            },
            "Address" => def.address = Some(rest.to_string()),
            "Attributes" => {
                for pair in rest.split_whitespace() {
                    let Some((name, value)) = pair.split_once('=') else {
                        warn!("server definitions: malformed attribute {pair:?}");
                        continue;
                    };
                    match (attr_index(name), value.parse::<i32>()) {
                        (Some(ix), Ok(v)) => def.attrs.push((ix, v)),
                        (None, _) => {
                            debug!("server definitions: discarding unknown attribute {name}");
                        }
                        (_, Err(_)) => {
                            warn!("server definitions: non-numeric attribute {pair:?}");
                        }
                    }
                }
            }
            "Type" => {
                for word in rest.split_whitespace() {
                    match ServerTypes::from_word(word) {
                        Some(bit) => def.types |= bit,
                        None => {
                            warn!(
                                "server definitions: unknown type word {word:?}, aborting server"
                            );
                            def.bad_type = true;
                        }
                    }
                }
            }
            other => warn!("server definitions: unknown keyword {other:?}"),
        }
    }

    if !seen_wrapper && added == 0 {
        debug!("server definitions: no <ServerDefines> wrapper found");
    }
    Ok(added)
}

fn finish_def(cache: &SidCache, def: PartialDef) -> Result<bool> {
    if def.bad_type {
        return Ok(false);
    }
    let (Some(sid), Some(address)) = (def.sid, def.address) else {
        warn!("server definitions: block missing SID or Address, skipping");
        return Ok(false);
    };
    let mut rec = ServerRecord::new(sid, &address);
    rec.alias = def.alias;
    for (ix, value) in def.attrs {
        rec.attrs[ix] = value;
    }
    match cache.add(&rec, def.types) {
        Ok(()) => Ok(true),
        Err(Error::Exists) => {
            warn!("server definitions: duplicate SID {sid}, keeping first definition");
            Ok(false)
        }
        Err(other) => Err(other),
    }
}

/// Save the whole catalog to `output` in SID order.
pub fn save<W: Write>(cache: &SidCache, output: &mut W) -> Result<()> {
    let records = cache.all_records()?;
    write_records(cache, &records, output)
}

/// Save only the records whose SIDs appear in `sids`, in SID order.
pub fn savelist<W: Write>(cache: &SidCache, sids: &[Sid], output: &mut W) -> Result<()> {
    let mut records = Vec::with_capacity(sids.len());
    for sid in sids {
        match cache.get(sid) {
            Ok(rec) => records.push(rec),
            Err(Error::NotFound) => warn!("savelist: {sid} is not cataloged"),
            Err(other) => return Err(other),
        }
    }
    records.sort_by(|a, b| a.sid.cmp(&b.sid));
    write_records(cache, &records, output)
}

fn write_records<W: Write>(
    cache: &SidCache,
    records: &[ServerRecord],
    output: &mut W,
) -> Result<()> {
    writeln!(output, "<ServerDefines>")?;
    for rec in records {
        writeln!(output, "\t<ServerDef>")?;
        if let Some(alias) = &rec.alias {
            writeln!(output, "\t\tAlias {alias}")?;
        }
        writeln!(output, "\t\tSID {}", rec.sid)?;
        writeln!(output, "\t\tAddress {}", rec.url)?;
        let pairs: Vec<String> = rec
            .attrs
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v >= 0)
            .map(|(i, v)| format!("{}={v}", super::SID_ATTR_NAMES[i]))
            .collect();
        if !pairs.is_empty() {
            writeln!(output, "\t\tAttributes {}", pairs.join(" "))?;
        }
        let types = cache.types_of(&rec.sid)?;
        if !types.is_empty() {
            writeln!(output, "\t\tType {}", types.words().join(" "))?;
        }
        writeln!(output, "\t</ServerDef>")?;
    }
    writeln!(output, "</ServerDefines>")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u8) -> Sid {
        Sid([n; 16])
    }

    #[test]
    fn load_parses_blocks() {
        let cache = SidCache::new();
        let text = format!(
            "<ServerDefines>\n\
             \t<ServerDef>\n\
             \t\tAlias node-a\n\
             \t\tSID {}\n\
             \t\tAddress tcp://node-a:3334\n\
             \t\tAttributes rack=1 bogus=9 zone=2\n\
             \t\tType META DATA\n\
             \t</ServerDef>\n\
             </ServerDefines>\n",
            sid(1)
        );
        let added = load(&cache, text.as_bytes()).unwrap();
        assert_eq!(added, 1);

        let rec = cache.get(&sid(1)).unwrap();
        assert_eq!(rec.alias.as_deref(), Some("node-a"));
        assert_eq!(rec.url, "tcp://node-a:3334");
        assert_eq!(rec.attrs[attr_index("rack").expect("known")], 1);
        assert_eq!(rec.attrs[attr_index("zone").expect("known")], 2);
        assert_eq!(
            cache.types_of(&sid(1)).unwrap(),
            ServerTypes::META | ServerTypes::DATA
        );
    }

    #[test]
    fn unknown_type_word_aborts_that_server() {
        let cache = SidCache::new();
        let text = format!(
            "<ServerDefines>\n\
             <ServerDef>\nSID {}\nAddress tcp://a:1\nType WIDGET\n</ServerDef>\n\
             <ServerDef>\nSID {}\nAddress tcp://b:1\nType META\n</ServerDef>\n\
             </ServerDefines>\n",
            sid(1),
            sid(2)
        );
        let added = load(&cache, text.as_bytes()).unwrap();
        assert_eq!(added, 1);
        assert!(cache.get(&sid(1)).is_err());
        assert!(cache.get(&sid(2)).is_ok());
    }

    #[test]
    fn duplicate_sid_keeps_first() {
        let cache = SidCache::new();
        let text = format!(
            "<ServerDefines>\n\
             <ServerDef>\nSID {0}\nAddress tcp://first:1\n</ServerDef>\n\
             <ServerDef>\nSID {0}\nAddress tcp://second:1\n</ServerDef>\n\
             </ServerDefines>\n",
            sid(1)
        );
        let added = load(&cache, text.as_bytes()).unwrap();
        assert_eq!(added, 1);
        assert_eq!(cache.get(&sid(1)).unwrap().url, "tcp://first:1");
    }

    #[test]
    fn save_load_round_trip() {
        let cache = SidCache::new();
        for n in [3u8, 1, 2] {
            let mut rec = ServerRecord::new(sid(n), &format!("tcp://node{n}:3334"));
            rec.attrs[attr_index("rack").expect("known")] = n as i32;
            rec.alias = Some(format!("node-{n}"));
            cache.add(&rec, ServerTypes::DATA).unwrap();
        }

        let mut buf = Vec::new();
        save(&cache, &mut buf).unwrap();

        let reloaded = SidCache::new();
        let added = load(&reloaded, buf.as_slice()).unwrap();
        assert_eq!(added, 3);
        assert_eq!(reloaded.all_records().unwrap(), cache.all_records().unwrap());
        for n in 1..=3u8 {
            assert_eq!(reloaded.types_of(&sid(n)).unwrap(), ServerTypes::DATA);
        }
    }

    #[test]
    fn savelist_writes_subset() {
        let cache = SidCache::new();
        for n in 1..=3u8 {
            cache
                .add(&ServerRecord::new(sid(n), "tcp://x:1"), ServerTypes::empty())
                .unwrap();
        }
        let mut buf = Vec::new();
        savelist(&cache, &[sid(3), sid(1)], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(&sid(1).to_string()));
        assert!(!text.contains(&sid(2).to_string()));
        assert!(text.contains(&sid(3).to_string()));
        // sorted output
        let p1 = text.find(&sid(1).to_string()).unwrap();
        let p3 = text.find(&sid(3).to_string()).unwrap();
        assert!(p1 < p3);
    }
}
