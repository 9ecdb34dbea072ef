use crate::DecodeError;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Labels arranged by their dotted key segments.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Node {
    Leaf(String),
    Branch(BTreeMap<String, Node>),
}

impl Node {
    /// Builds the tree of all labels matching one of `filters`, with the
    /// `root` segment stripped. A filter matches a key that equals it or
    /// continues it with a `.`, ignoring case.
    pub(crate) fn from_labels<I, K, V>(
        labels: I,
        root: &str,
        filters: &[&str],
    ) -> Result<Node, DecodeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut children = BTreeMap::new();

        for (key, value) in labels {
            let key = key.as_ref();
            if !filters.iter().any(|filter| matches_filter(key, filter)) {
                continue;
            }

            let Some(rest) = strip_prefix_ignore_case(key, root)
                .and_then(|rest| rest.strip_prefix('.'))
            else {
                continue;
            };

            let segments =
                split_segments(rest).ok_or_else(|| DecodeError::InvalidKey(key.into()))?;
            insert(&mut children, &segments, value.as_ref(), key)?;
        }

        Ok(Node::Branch(children))
    }
}

fn matches_filter(key: &str, filter: &str) -> bool {
    match strip_prefix_ignore_case(key, filter) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

fn strip_prefix_ignore_case<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let head = key.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&key[prefix.len()..])
    } else {
        None
    }
}

/// Splits `loadbalancer.servers[0].url` into `loadbalancer`, `servers`, `[0]`, `url`.
fn split_segments(key: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();

    for part in key.split('.') {
        let (name, index) = match part.find('[') {
            Some(open) => (&part[..open], Some(&part[open..])),
            None => (part, None),
        };

        if name.is_empty() {
            return None;
        }
        segments.push(name.to_string());

        if let Some(index) = index {
            let inner = index.strip_prefix('[')?.strip_suffix(']')?;
            inner.parse::<usize>().ok()?;
            segments.push(index.to_string());
        }
    }

    Some(segments)
}

fn insert(
    children: &mut BTreeMap<String, Node>,
    segments: &[String],
    value: &str,
    key: &str,
) -> Result<(), DecodeError> {
    let Some((first, rest)) = segments.split_first() else {
        return Err(DecodeError::InvalidKey(key.into()));
    };

    if rest.is_empty() {
        return match children.entry(first.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Node::Leaf(value.to_string()));
                Ok(())
            }
            Entry::Occupied(_) => Err(DecodeError::Conflict(key.into())),
        };
    }

    let child = children
        .entry(first.clone())
        .or_insert_with(|| Node::Branch(BTreeMap::new()));

    match child {
        Node::Branch(grandchildren) => insert(grandchildren, rest, value, key),
        Node::Leaf(_) => Err(DecodeError::Conflict(key.into())),
    }
}

/// Returns the position encoded in an index segment such as `[3]`.
pub(crate) fn parse_index(segment: &str) -> Option<usize> {
    segment
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .and_then(|s| s.parse().ok())
}
