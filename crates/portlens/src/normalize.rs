//! Record normalization: map decoded values of any known upstream shape onto
//! the canonical export/import/lane lists.
//!
//! Container and field names are matched against [`FieldAliases`] after
//! case-folding and stripping `_`, `-` and spaces, so `exitPorts`,
//! `exit_ports` and `Exit Ports` are the same key. Supporting a new
//! upstream shape means adding an alias, nothing else.

use crate::decode::{StructuredValue, ValueOrigin};
use crate::types::{CompanyResult, EndpointCategory, LaneRecord, PortRecord};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

const LANE_SEPARATORS: [&str; 5] = ["→", "->", "=>", "⇒", "—>"];

/// Known field and container names per upstream schema variant.
#[derive(Debug, Clone)]
pub struct FieldAliases {
    pub export_containers: Vec<String>,
    pub import_containers: Vec<String>,
    pub lane_containers: Vec<String>,
    pub port_name: Vec<String>,
    pub count: Vec<String>,
    pub lane_exit: Vec<String>,
    pub lane_entry: Vec<String>,
    pub lane_label: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            export_containers: strings(&[
                "exit_ports",
                "export_ports",
                "top_ports_shipped_from",
                "ports_shipped_from",
                "origin_ports",
                "from_ports",
                "shipping_from",
                "loading_ports",
            ]),
            import_containers: strings(&[
                "entry_ports",
                "import_ports",
                "top_ports_shipped_to",
                "ports_shipped_to",
                "destination_ports",
                "to_ports",
                "shipping_to",
                "discharge_ports",
            ]),
            lane_containers: strings(&[
                "lanes",
                "trade_lanes",
                "lane_permutations",
                "top_lanes_used",
                "top_lanes",
                "routes",
                "shipping_lanes",
                "trade_routes",
                "shipping_routes",
            ]),
            port_name: strings(&["port", "name", "port_name", "label", "location"]),
            count: strings(&[
                "shipments",
                "count",
                "shipment_count",
                "total_shipments",
                "num_shipments",
                "total",
                "value",
                "doc_count",
            ]),
            lane_exit: strings(&["exit_port", "from", "origin", "origin_port", "from_port", "source"]),
            lane_entry: strings(&[
                "entry_port",
                "to",
                "destination",
                "destination_port",
                "to_port",
                "target",
            ]),
            lane_label: strings(&["lane", "route", "label", "name"]),
        }
    }
}

fn canonical(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn matches_alias(key: &str, aliases: &[String]) -> bool {
    let key = canonical(key);
    aliases.iter().any(|alias| canonical(alias) == key)
}

/// First non-null field whose key matches an alias.
fn field<'v>(obj: &'v Map<String, Value>, aliases: &[String]) -> Option<&'v Value> {
    aliases.iter().find_map(|alias| {
        let alias = canonical(alias);
        obj.iter()
            .find(|(key, value)| canonical(key) == alias && !value.is_null())
            .map(|(_, value)| value)
    })
}

fn clean_name(raw: &str) -> Option<String> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!name.is_empty()).then_some(name)
}

/// Text of a name-like field; nested `{ "name": ... }` objects are unwrapped.
fn text_field(obj: &Map<String, Value>, aliases: &[String], name_aliases: &[String]) -> Option<String> {
    match field(obj, aliases)? {
        Value::String(s) => clean_name(s),
        Value::Object(inner) => match field(inner, name_aliases)? {
            Value::String(s) => clean_name(s),
            _ => None,
        },
        _ => None,
    }
}

/// Coerce an upstream count to a non-negative integer.
///
/// Numeric strings may contain thousands separators. Negative, fractional
/// below zero or non-numeric values become 0.
pub fn coerce_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => parse_count(s).unwrap_or(0),
        _ => 0,
    }
}

fn parse_count(raw: &str) -> Option<u64> {
    let digits: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if let Ok(n) = digits.parse::<u64>() {
        return Some(n);
    }
    digits
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(|f| if f > 0.0 { f as u64 } else { 0 })
}

/// Split `"Yantian → Long Beach"` style labels into exit and entry ports.
pub fn split_lane(label: &str) -> Option<(String, String)> {
    let split = LANE_SEPARATORS
        .iter()
        .find_map(|sep| label.split_once(sep))
        .or_else(|| {
            let lower = label.to_ascii_lowercase();
            lower
                .find(" to ")
                .map(|at| (&label[..at], &label[at + " to ".len()..]))
        })?;
    Some((clean_name(split.0)?, clean_name(split.1)?))
}

/// Maps decoded values onto a [`CompanyResult`].
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    aliases: FieldAliases,
    max_records: Option<usize>,
}

#[derive(Default)]
struct Collected {
    export: Vec<PortRecord>,
    import: Vec<PortRecord>,
    lanes: Vec<LaneRecord>,
}

impl Normalizer {
    pub fn new(max_records: Option<usize>) -> Self {
        Self {
            aliases: FieldAliases::default(),
            max_records,
        }
    }

    pub fn with_aliases(mut self, aliases: FieldAliases) -> Self {
        self.aliases = aliases;
        self
    }

    /// Categories that `values` fill with at least one record.
    pub fn covered_categories(&self, values: &[StructuredValue]) -> Vec<EndpointCategory> {
        let result = self.normalize("", values, DateTime::<Utc>::UNIX_EPOCH);
        let missing = result.missing_categories();
        EndpointCategory::ALL
            .into_iter()
            .filter(|category| !missing.contains(category))
            .collect()
    }

    /// Build the canonical result. Pure: the same input always yields the
    /// same output.
    ///
    /// Values from the rendered page only fill categories that no data
    /// endpoint supplied, so a page summary never double-counts API data.
    pub fn normalize(
        &self,
        company: &str,
        values: &[StructuredValue],
        extracted_at: DateTime<Utc>,
    ) -> CompanyResult {
        let mut endpoint = Collected::default();
        let mut document = Collected::default();
        for value in values {
            let target = match value.origin {
                ValueOrigin::Endpoint => &mut endpoint,
                ValueOrigin::Document => &mut document,
            };
            self.collect(value, target);
        }

        if endpoint.export.is_empty() {
            endpoint.export = document.export;
        }
        if endpoint.import.is_empty() {
            endpoint.import = document.import;
        }
        if endpoint.lanes.is_empty() {
            endpoint.lanes = document.lanes;
        }

        CompanyResult {
            company: company.to_string(),
            export_ports: self.finish_ports(endpoint.export),
            import_ports: self.finish_ports(endpoint.import),
            trade_lanes: self.finish_lanes(endpoint.lanes),
            extracted_at,
            partial: false,
            diagnostics: Vec::new(),
        }
    }

    fn collect(&self, value: &StructuredValue, out: &mut Collected) {
        let mut containers = Vec::new();
        self.find_containers(&value.value, &mut containers);
        if containers.is_empty() {
            if let Some(category) = value.category {
                containers.push((category, &value.value));
            }
        }
        for (category, container) in containers {
            match category {
                EndpointCategory::ExportPorts => self.port_records(container, &mut out.export),
                EndpointCategory::ImportPorts => self.port_records(container, &mut out.import),
                EndpointCategory::TradeLanes => self.lane_records(container, &mut out.lanes),
            }
        }
    }

    fn container_category(&self, key: &str) -> Option<EndpointCategory> {
        let a = &self.aliases;
        if matches_alias(key, &a.export_containers) {
            Some(EndpointCategory::ExportPorts)
        } else if matches_alias(key, &a.import_containers) {
            Some(EndpointCategory::ImportPorts)
        } else if matches_alias(key, &a.lane_containers) {
            Some(EndpointCategory::TradeLanes)
        } else {
            None
        }
    }

    fn find_containers<'v>(&self, value: &'v Value, found: &mut Vec<(EndpointCategory, &'v Value)>) {
        match value {
            Value::Object(obj) => {
                for (key, child) in obj {
                    match self.container_category(key) {
                        Some(category) if child.is_array() || child.is_object() => {
                            found.push((category, child));
                        }
                        _ => self.find_containers(child, found),
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.find_containers(item, found);
                }
            }
            _ => {}
        }
    }

    fn port_records(&self, container: &Value, out: &mut Vec<PortRecord>) {
        self.records(
            container,
            out,
            &|obj| self.port_from_object(obj),
            &|name, shipments| {
                clean_name(name).map(|port| PortRecord { port, shipments })
            },
        );
    }

    fn lane_records(&self, container: &Value, out: &mut Vec<LaneRecord>) {
        self.records(
            container,
            out,
            &|obj| self.lane_from_object(obj),
            &|label, shipments| {
                split_lane(label).map(|(exit_port, entry_port)| LaneRecord {
                    exit_port,
                    entry_port,
                    shipments,
                })
            },
        );
    }

    /// Walk a container of records: arrays of objects or `[label, count]`
    /// pairs, wrapper objects holding arrays, single record objects, or
    /// maps of `label -> count`.
    fn records<R>(
        &self,
        container: &Value,
        out: &mut Vec<R>,
        from_object: &dyn Fn(&Map<String, Value>) -> Option<R>,
        from_entry: &dyn Fn(&str, u64) -> Option<R>,
    ) {
        match container {
            Value::Array(items) => {
                for item in items {
                    let record = match item {
                        Value::Object(obj) => from_object(obj),
                        Value::Array(pair) => match pair.as_slice() {
                            [Value::String(label), count] if !count.is_null() => {
                                from_entry(label.as_str(), coerce_count(count))
                            }
                            _ => None,
                        },
                        _ => None,
                    };
                    out.extend(record);
                }
            }
            Value::Object(obj) => {
                let nested: Vec<&Value> = obj.values().filter(|v| v.is_array()).collect();
                if !nested.is_empty() {
                    for inner in nested {
                        self.records(inner, out, from_object, from_entry);
                    }
                } else if let Some(record) = from_object(obj) {
                    out.push(record);
                } else {
                    for (label, value) in obj {
                        let count = match value {
                            Value::Number(_) => Some(coerce_count(value)),
                            Value::String(s) => parse_count(s),
                            Value::Object(inner) => field(inner, &self.aliases.count).map(coerce_count),
                            _ => None,
                        };
                        if let Some(count) = count {
                            out.extend(from_entry(label.as_str(), count));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn port_from_object(&self, obj: &Map<String, Value>) -> Option<PortRecord> {
        let a = &self.aliases;
        let port = text_field(obj, &a.port_name, &a.port_name)?;
        let shipments = coerce_count(field(obj, &a.count)?);
        Some(PortRecord { port, shipments })
    }

    fn lane_from_object(&self, obj: &Map<String, Value>) -> Option<LaneRecord> {
        let a = &self.aliases;
        let shipments = coerce_count(field(obj, &a.count)?);
        let ends = text_field(obj, &a.lane_exit, &a.port_name)
            .zip(text_field(obj, &a.lane_entry, &a.port_name));
        let (exit_port, entry_port) = match ends {
            Some(ends) => ends,
            None => split_lane(&text_field(obj, &a.lane_label, &a.port_name)?)?,
        };
        Some(LaneRecord {
            exit_port,
            entry_port,
            shipments,
        })
    }

    fn finish_ports(&self, records: Vec<PortRecord>) -> Vec<PortRecord> {
        let mut merged: Vec<PortRecord> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for record in records {
            match index.get(&record.port) {
                Some(&i) => merged[i].shipments = merged[i].shipments.saturating_add(record.shipments),
                None => {
                    index.insert(record.port.clone(), merged.len());
                    merged.push(record);
                }
            }
        }
        merged.sort_by(|a, b| b.shipments.cmp(&a.shipments).then_with(|| a.port.cmp(&b.port)));
        self.truncate(merged)
    }

    fn finish_lanes(&self, records: Vec<LaneRecord>) -> Vec<LaneRecord> {
        let mut merged: Vec<LaneRecord> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        for record in records {
            let key = (record.exit_port.clone(), record.entry_port.clone());
            match index.get(&key) {
                Some(&i) => merged[i].shipments = merged[i].shipments.saturating_add(record.shipments),
                None => {
                    index.insert(key, merged.len());
                    merged.push(record);
                }
            }
        }
        merged.sort_by(|a, b| {
            b.shipments
                .cmp(&a.shipments)
                .then_with(|| a.exit_port.cmp(&b.exit_port))
                .then_with(|| a.entry_port.cmp(&b.entry_port))
        });
        self.truncate(merged)
    }

    fn truncate<R>(&self, mut records: Vec<R>) -> Vec<R> {
        if let Some(max) = self.max_records {
            records.truncate(max);
        }
        records
    }
}
