// Property-based tests using proptest

use geos::csv_dump::write_csv;
use geos::geonames::{City, Index};
use geos::{
    models, DataValue, Database, Filter, InsertMode, IpVersion, MmdbBuilder, Patch,
    PatchedDatabase, Reader,
};
use ipnet::{IpNet, Ipv4Net};
use proptest::prelude::*;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Deserialize)]
struct Tag {
    v: String,
}

fn network() -> impl Strategy<Value = Ipv4Net> {
    (any::<u32>(), 8u8..=32).prop_map(|(addr, len)| {
        Ipv4Net::new(Ipv4Addr::from(addr), len).unwrap().trunc()
    })
}

fn networks(max: usize) -> impl Strategy<Value = Vec<Ipv4Net>> {
    prop::collection::btree_set(network(), 1..max).prop_map(|set| {
        let mut nets: Vec<Ipv4Net> = set.into_iter().collect();
        nets.sort_by_key(|n| n.prefix_len());
        nets
    })
}

/// Less specific networks first, so every network keeps its own value
fn build(nets: &[Ipv4Net], label: &str) -> Reader {
    let mut builder = MmdbBuilder::new("GEOS-Test", IpVersion::V6);
    for (i, net) in nets.iter().enumerate() {
        let value = DataValue::from_json(&serde_json::json!({ "v": format!("{}{}", label, i) }))
            .unwrap();
        builder
            .insert(IpNet::V4(*net), value, InsertMode::Replace)
            .unwrap();
    }
    builder.build_reader().unwrap()
}

/// Most specific network containing `ip`, with its label
fn longest_match(nets: &[Ipv4Net], label: &str, ip: Ipv4Addr) -> Option<(String, Ipv4Net)> {
    nets.iter()
        .enumerate()
        .filter(|(_, n)| n.contains(&ip))
        .max_by_key(|(_, n)| n.prefix_len())
        .map(|(i, n)| (format!("{}{}", label, i), *n))
}

fn probes(nets: &[Ipv4Net], extra: &[u32]) -> Vec<Ipv4Addr> {
    nets.iter()
        .flat_map(|n| [n.network(), n.broadcast()])
        .chain(extra.iter().map(|&a| Ipv4Addr::from(a)))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_lookup_is_longest_prefix_match(
        nets in networks(40),
        extra in prop::collection::vec(any::<u32>(), 0..20)
    ) {
        let reader = build(&nets, "n");
        for ip in probes(&nets, &extra) {
            let found = reader.lookup::<Tag>(IpAddr::V4(ip)).unwrap();
            match (found, longest_match(&nets, "n", ip)) {
                (Some((tag, _)), Some((label, _))) => prop_assert_eq!(tag.v, label),
                (None, None) => {}
                (found, expected) => prop_assert!(
                    false,
                    "{}: found {:?}, expected {:?}",
                    ip,
                    found.map(|(t, n)| (t.v, n)),
                    expected
                ),
            }
        }
    }

    #[test]
    fn test_build_is_deterministic(nets in networks(30)) {
        let first = build(&nets, "n");
        let second = build(&nets, "n");
        prop_assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn test_patch_takes_precedence(
        base in networks(25),
        patch in networks(10),
        extra in prop::collection::vec(any::<u32>(), 0..20)
    ) {
        let records = patch
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let value = DataValue::from_json(&serde_json::json!({ "v": format!("p{}", i) }));
                (IpNet::V4(*n), value.unwrap())
            })
            .collect();
        let layers: Vec<Arc<dyn Database>> = vec![
            Arc::new(build(&base, "b")),
            Arc::new(Patch::from_records(records, "GEOS-Test", SystemTime::now()).unwrap()),
        ];
        let db = PatchedDatabase::new(layers);

        let all: Vec<Ipv4Net> = base.iter().chain(patch.iter()).copied().collect();
        for ip in probes(&all, &extra) {
            let expected = longest_match(&patch, "p", ip).or_else(|| longest_match(&base, "b", ip));
            let found = db.lookup::<Tag>(IpAddr::V4(ip)).unwrap();
            prop_assert_eq!(found.map(|(t, _)| t.v), expected.map(|(label, _)| label));
        }
    }

    #[test]
    fn test_csv_has_one_row_per_network(nets in networks(30)) {
        let reader = build(&nets, "n");
        let expected = reader
            .networks(geos::NetworksOptions::skip_aliased())
            .count();

        let mut out = Vec::new();
        let rows = write_csv::<models::Isp, _>(&reader, &mut out).unwrap();
        prop_assert_eq!(rows, expected);
        prop_assert_eq!(String::from_utf8(out).unwrap().lines().count(), rows + 1);
    }

    #[test]
    fn test_geonames_filter_matches_naive_scan(
        entries in prop::collection::vec(("[A-Ca-c]{1,4}", "(FR|IT|SR|DE)"), 0..60),
        prefix in "[A-Ca-c]{0,2}",
        codes in prop::collection::btree_set("(FR|IT|SR|DE)", 0..3),
        limit in 0usize..10
    ) {
        let cities: Vec<City> = entries
            .iter()
            .enumerate()
            .map(|(i, (name, country))| City {
                geoname_id: i as u32 + 1,
                name: name.clone(),
                country_code: country.clone(),
                ..Default::default()
            })
            .collect();
        let index = Index::new(cities.clone()).unwrap();
        let filter = Filter {
            country_codes: codes.iter().cloned().collect(),
            name_prefix: prefix.clone(),
            limit,
            ..Default::default()
        };
        let selected = index.filtered(&filter);

        let lowered = prefix.to_ascii_lowercase();
        let matching: BTreeSet<u32> = cities
            .iter()
            .filter(|c| codes.is_empty() || codes.contains(&c.country_code))
            .filter(|c| c.name.to_ascii_lowercase().starts_with(&lowered))
            .map(|c| c.geoname_id)
            .collect();

        let expected_len = if limit > 0 { matching.len().min(limit) } else { matching.len() };
        prop_assert_eq!(selected.len(), expected_len);
        for city in &selected {
            prop_assert!(matching.contains(&city.geoname_id));
        }
        if !prefix.is_empty() {
            let names: Vec<String> = selected.iter().map(|c| c.name.to_ascii_lowercase()).collect();
            prop_assert!(names.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
