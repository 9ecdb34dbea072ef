use crate::DecodeError;
use crate::tree::{Node, parse_index};
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor,
};
use std::collections::BTreeMap;
use std::collections::btree_map;
use std::str::FromStr;
use std::vec;

/// Decodes the labels under `filters` into `T`.
///
/// `root` is the label namespace (e.g. `traefik`) and is stripped from every
/// key before decoding. Labels that match none of the filters are ignored.
pub fn decode<T, I, K, V>(labels: I, root: &str, filters: &[&str]) -> Result<T, DecodeError>
where
    T: DeserializeOwned,
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let node = Node::from_labels(labels, root, filters)?;
    T::deserialize(NodeDeserializer {
        node,
        path: root.to_string(),
    })
}

struct NodeDeserializer {
    node: Node,
    path: String,
}

impl NodeDeserializer {
    fn invalid(self, expected: &'static str) -> DecodeError {
        let value = match self.node {
            Node::Leaf(value) => value,
            Node::Branch(_) => "<nested labels>".to_string(),
        };
        DecodeError::InvalidValue {
            path: self.path,
            value,
            expected,
        }
    }

    fn parse<T: FromStr>(self, expected: &'static str) -> Result<T, DecodeError> {
        if let Node::Leaf(value) = &self.node
            && let Ok(parsed) = value.trim().parse()
        {
            return Ok(parsed);
        }
        Err(self.invalid(expected))
    }

    fn parse_bool(self) -> Result<bool, DecodeError> {
        if let Node::Leaf(value) = &self.node {
            let value = value.trim();
            if value.eq_ignore_ascii_case("true") {
                return Ok(true);
            }
            if value.eq_ignore_ascii_case("false") {
                return Ok(false);
            }
        }
        Err(self.invalid("a boolean"))
    }
}

/// Re-keys children by the struct field they name, ignoring case. Two spellings
/// of the same field are merged when both are nested labels.
fn canonicalize(
    children: BTreeMap<String, Node>,
    fields: &'static [&'static str],
    path: &str,
) -> Result<BTreeMap<String, Node>, DecodeError> {
    let mut canonical: BTreeMap<String, Node> = BTreeMap::new();

    for (key, node) in children {
        let name = fields
            .iter()
            .find(|field| field.eq_ignore_ascii_case(&key))
            .map(|field| field.to_string())
            .unwrap_or(key);

        let merged = match canonical.remove(&name) {
            Some(existing) => merge_nodes(existing, node, &format!("{path}.{name}"))?,
            None => node,
        };
        canonical.insert(name, merged);
    }

    Ok(canonical)
}

fn merge_nodes(left: Node, right: Node, path: &str) -> Result<Node, DecodeError> {
    match (left, right) {
        (Node::Branch(mut left), Node::Branch(right)) => {
            for (key, node) in right {
                let merged = match left.remove(&key) {
                    Some(existing) => merge_nodes(existing, node, &format!("{path}.{key}"))?,
                    None => node,
                };
                left.insert(key, merged);
            }
            Ok(Node::Branch(left))
        }
        _ => Err(DecodeError::Conflict(path.to_string())),
    }
}

macro_rules! deserialize_number {
    ($($method:ident => $visit:ident($ty:ty)),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
                visitor.$visit(self.parse::<$ty>(concat!("a value of type ", stringify!($ty)))?)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for NodeDeserializer {
    type Error = DecodeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.node {
            Node::Leaf(value) => visitor.visit_string(value),
            Node::Branch(children) => visitor.visit_map(NodeMap::new(children, self.path)),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_bool(self.parse_bool()?)
    }

    deserialize_number! {
        deserialize_i8 => visit_i8(i8),
        deserialize_i16 => visit_i16(i16),
        deserialize_i32 => visit_i32(i32),
        deserialize_i64 => visit_i64(i64),
        deserialize_u8 => visit_u8(u8),
        deserialize_u16 => visit_u16(u16),
        deserialize_u32 => visit_u32(u32),
        deserialize_u64 => visit_u64(u64),
        deserialize_f32 => visit_f32(f32),
        deserialize_f64 => visit_f64(f64),
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_some(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    /// Lists come either from a comma separated value, from indexed children
    /// (`servers[0]`, `servers[1]`) or from a single nested section.
    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        let NodeDeserializer { node, path } = self;

        let items: Vec<NodeDeserializer> = match node {
            Node::Leaf(value) => value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .enumerate()
                .map(|(i, item)| NodeDeserializer {
                    node: Node::Leaf(item.to_string()),
                    path: format!("{path}[{i}]"),
                })
                .collect(),
            Node::Branch(children)
                if !children.is_empty() && children.keys().all(|k| parse_index(k).is_some()) =>
            {
                let mut indexed: Vec<(usize, String, Node)> = children
                    .into_iter()
                    .filter_map(|(key, node)| parse_index(&key).map(|i| (i, key, node)))
                    .collect();
                indexed.sort_by_key(|(i, _, _)| *i);
                indexed
                    .into_iter()
                    .map(|(_, key, node)| NodeDeserializer {
                        node,
                        path: format!("{path}{key}"),
                    })
                    .collect()
            }
            node => vec![NodeDeserializer { node, path }],
        };

        visitor.visit_seq(NodeSeq {
            items: items.into_iter(),
        })
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Self::Error> {
        match self.node {
            Node::Branch(children) => visitor.visit_map(NodeMap::new(children, self.path)),
            Node::Leaf(_) => Err(self.invalid("nested labels")),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        let NodeDeserializer { node, path } = self;
        match node {
            // `tls=true` enables the section with its defaults.
            Node::Leaf(value) if value.trim().eq_ignore_ascii_case("true") => {
                visitor.visit_map(NodeMap::new(BTreeMap::new(), path))
            }
            Node::Leaf(value) => Err(DecodeError::InvalidValue {
                path,
                value,
                expected: "`true` or nested labels",
            }),
            Node::Branch(children) => {
                let children = canonicalize(children, fields, &path)?;
                visitor.visit_map(NodeMap::new(children, path))
            }
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        match self.node {
            Node::Leaf(value) => {
                let value: de::value::StringDeserializer<DecodeError> =
                    value.trim().to_string().into_deserializer();
                visitor.visit_enum(value)
            }
            Node::Branch(_) => Err(self.invalid("a single value")),
        }
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(
        self,
        visitor: V,
    ) -> Result<V::Value, Self::Error> {
        visitor.visit_unit()
    }

    serde::forward_to_deserialize_any! {
        char str string bytes byte_buf tuple tuple_struct identifier
    }
}

struct NodeMap {
    iter: btree_map::IntoIter<String, Node>,
    pending: Option<NodeDeserializer>,
    path: String,
}

impl NodeMap {
    fn new(children: BTreeMap<String, Node>, path: String) -> Self {
        NodeMap {
            iter: children.into_iter(),
            pending: None,
            path,
        }
    }
}

impl<'de> MapAccess<'de> for NodeMap {
    type Error = DecodeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, Self::Error> {
        let Some((key, node)) = self.iter.next() else {
            return Ok(None);
        };

        self.pending = Some(NodeDeserializer {
            node,
            path: format!("{}.{key}", self.path),
        });

        let key: de::value::StringDeserializer<DecodeError> = key.into_deserializer();
        seed.deserialize(key).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> Result<V::Value, Self::Error> {
        let value = self
            .pending
            .take()
            .ok_or_else(|| DecodeError::Message("label value requested before its key".into()))?;
        seed.deserialize(value)
    }
}

struct NodeSeq {
    items: vec::IntoIter<NodeDeserializer>,
}

impl<'de> SeqAccess<'de> for NodeSeq {
    type Error = DecodeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, Self::Error> {
        match self.items.next() {
            Some(item) => seed.deserialize(item).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamic::{Configuration, RouterTls};
    use serde::Deserialize;

    const FILTERS: &[&str] = &["traefik.http", "traefik.tcp", "traefik.udp"];

    fn decode_config(labels: &[(&str, &str)]) -> Result<Configuration, DecodeError> {
        decode(labels.iter().copied(), "traefik", FILTERS)
    }

    #[test]
    fn test_decode_router_and_service() {
        let config = decode_config(&[
            ("traefik.http.routers.Router1.rule", "Host(`foo.bar`)"),
            ("traefik.http.routers.Router1.entrypoints", "web, websecure"),
            ("traefik.http.routers.Router1.priority", "42"),
            ("traefik.http.services.Service1.loadbalancer.passhostheader", "true"),
            ("traefik.http.services.Service1.loadbalancer.server.port", "8080"),
        ])
        .unwrap();

        let router = &config.http.routers["Router1"];
        assert_eq!(router.rule, "Host(`foo.bar`)");
        assert_eq!(router.entry_points, vec!["web", "websecure"]);
        assert_eq!(router.priority, Some(42));

        let lb = config.http.services["Service1"]
            .load_balancer
            .as_ref()
            .unwrap();
        assert_eq!(lb.pass_host_header, Some(true));
        assert_eq!(lb.servers.len(), 1);
        assert_eq!(lb.servers[0].port.as_deref(), Some("8080"));
    }

    #[test]
    fn test_field_names_ignore_case() {
        let config = decode_config(&[
            ("traefik.http.routers.r.rule", "Path(`/`)"),
            ("traefik.HTTP.Routers.r.Service", "svc"),
            ("traefik.http.services.svc.loadBalancer.passHostHeader", "FALSE"),
        ])
        .unwrap();

        assert_eq!(config.http.routers["r"].rule, "Path(`/`)");
        assert_eq!(config.http.routers["r"].service, "svc");
        let lb = config.http.services["svc"].load_balancer.as_ref().unwrap();
        assert_eq!(lb.pass_host_header, Some(false));
    }

    #[test]
    fn test_entity_names_keep_case() {
        let config = decode_config(&[
            ("traefik.http.routers.Foo.rule", "a"),
            ("traefik.http.routers.foo.rule", "b"),
        ])
        .unwrap();
        assert_eq!(config.http.routers.len(), 2);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let config = decode_config(&[
            ("traefik.http.routers.r.rule", "a"),
            ("traefik.http.routers.r.unknown.nested", "x"),
            ("traefik.http.whatever", "y"),
        ])
        .unwrap();
        assert_eq!(config.http.routers["r"].rule, "a");
    }

    #[test]
    fn test_malformed_value() {
        let err = decode_config(&[(
            "traefik.http.services.s.loadbalancer.passhostheader",
            "yes",
        )])
        .unwrap_err();

        assert_eq!(
            err,
            DecodeError::InvalidValue {
                path: "traefik.http.services.s.loadBalancer.passHostHeader".into(),
                value: "yes".into(),
                expected: "a boolean",
            }
        );

        let err = decode_config(&[("traefik.http.routers.r.priority", "high")]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue { .. }));
    }

    #[test]
    fn test_scalar_enables_section() {
        let config = decode_config(&[
            ("traefik.http.routers.r.tls", "true"),
            ("traefik.tcp.routers.t.tls.passthrough", "true"),
        ])
        .unwrap();

        assert_eq!(config.http.routers["r"].tls, Some(RouterTls::default()));
        assert!(config.tcp.routers["t"].tls.as_ref().unwrap().passthrough);
    }

    #[test]
    fn test_scalar_other_than_true_is_rejected() {
        let config = decode_config(&[("traefik.http.routers.r.tls", "TRUE")]).unwrap();
        assert_eq!(config.http.routers["r"].tls, Some(RouterTls::default()));

        for value in ["false", "no", ""] {
            let err = decode_config(&[("traefik.http.routers.r.tls", value)]).unwrap_err();
            assert_eq!(
                err,
                DecodeError::InvalidValue {
                    path: "traefik.http.routers.r.tls".into(),
                    value: value.into(),
                    expected: "`true` or nested labels",
                },
                "{value:?}"
            );
        }
    }

    #[test]
    fn test_indexed_servers() {
        let config = decode_config(&[
            ("traefik.http.services.s.loadbalancer.servers[1].url", "http://b"),
            ("traefik.http.services.s.loadbalancer.servers[0].url", "http://a"),
        ])
        .unwrap();
        let lb = config.http.services["s"].load_balancer.as_ref().unwrap();
        let urls: Vec<_> = lb.servers.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["http://a", "http://b"]);
    }

    #[test]
    fn test_decode_into_custom_struct() {
        #[derive(Deserialize, Default, Debug, PartialEq)]
        #[serde(default)]
        struct Extra {
            enable: Option<bool>,
        }

        let labels = BTreeMap::from([
            ("traefik.enable".to_string(), "false".to_string()),
            ("traefik.http.routers.r.rule".to_string(), "x".to_string()),
        ]);
        let extra: Extra = decode(&labels, "traefik", &["traefik.enable"]).unwrap();
        assert_eq!(extra.enable, Some(false));

        let extra: Extra = decode(
            BTreeMap::<String, String>::new(),
            "traefik",
            &["traefik.enable"],
        )
        .unwrap();
        assert_eq!(extra.enable, None);
    }
}
