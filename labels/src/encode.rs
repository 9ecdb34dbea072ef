use crate::EncodeError;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Flattens `value` into labels under `root`.
///
/// This is the lossy inverse of [`crate::decode`]: zero values (`null`, `false`,
/// `0`, empty strings and lists) are omitted, scalar lists are joined with `,`
/// and lists of sections are written as `name[i].field`. A section whose fields
/// are all zero is written as `name=true`, which decodes back to its defaults.
pub fn encode<T: Serialize>(
    value: &T,
    root: &str,
) -> Result<BTreeMap<String, String>, EncodeError> {
    let value = serde_json::to_value(value)?;
    let mut labels = BTreeMap::new();

    if let Value::Object(fields) = value {
        for (key, value) in fields {
            flatten(format!("{root}.{key}"), value, &mut labels);
        }
    } else {
        flatten(root.to_string(), value, &mut labels);
    }

    Ok(labels)
}

fn flatten(key: String, value: Value, labels: &mut BTreeMap<String, String>) {
    match value {
        Value::Null | Value::Bool(false) => {}
        Value::Bool(true) => {
            labels.insert(key, "true".into());
        }
        Value::Number(number) => {
            if number.as_f64() != Some(0.0) {
                labels.insert(key, number.to_string());
            }
        }
        Value::String(s) => {
            if !s.is_empty() {
                labels.insert(key, s);
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                return;
            }
            if items.iter().all(is_scalar) {
                let joined: Vec<String> = items.into_iter().filter_map(scalar_to_string).collect();
                labels.insert(key, joined.join(","));
            } else {
                for (i, item) in items.into_iter().enumerate() {
                    flatten(format!("{key}[{i}]"), item, labels);
                }
            }
        }
        Value::Object(fields) => {
            let before = labels.len();
            for (field, value) in fields {
                flatten(format!("{key}.{field}"), value, labels);
            }
            if labels.len() == before {
                labels.insert(key, "true".into());
            }
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;
    use dynamic::{Configuration, Router, RouterTls, Server, Service, ServersLoadBalancer};

    fn sample() -> Configuration {
        let mut config = Configuration::default();
        config.http.routers.insert(
            "web".into(),
            Router {
                entry_points: vec!["web".into(), "websecure".into()],
                service: "app".into(),
                rule: "Host(`app.example`)".into(),
                tls: Some(RouterTls::default()),
                ..Default::default()
            },
        );
        config.http.services.insert(
            "app".into(),
            Service {
                load_balancer: Some(ServersLoadBalancer {
                    servers: vec![
                        Server {
                            url: "http://10.0.0.1:80".into(),
                            ..Default::default()
                        },
                        Server {
                            url: "http://10.0.0.2:80".into(),
                            ..Default::default()
                        },
                    ],
                    pass_host_header: Some(false),
                    ..Default::default()
                }),
            },
        );
        config
    }

    #[test]
    fn test_encode_flattens_configuration() {
        let labels = encode(&sample(), "traefik").unwrap();

        let expected = BTreeMap::from([
            ("traefik.http.routers.web.entryPoints".to_string(), "web,websecure".to_string()),
            ("traefik.http.routers.web.rule".to_string(), "Host(`app.example`)".to_string()),
            ("traefik.http.routers.web.service".to_string(), "app".to_string()),
            ("traefik.http.routers.web.tls".to_string(), "true".to_string()),
            (
                "traefik.http.services.app.loadBalancer.servers[0].url".to_string(),
                "http://10.0.0.1:80".to_string(),
            ),
            (
                "traefik.http.services.app.loadBalancer.servers[1].url".to_string(),
                "http://10.0.0.2:80".to_string(),
            ),
        ]);

        // `passHostHeader: false` is a zero value and is dropped.
        assert_eq!(labels, expected);
    }

    #[test]
    fn test_encoded_labels_decode_back() {
        let mut config = sample();
        if let Some(lb) = config
            .http
            .services
            .get_mut("app")
            .and_then(|s| s.load_balancer.as_mut())
        {
            lb.pass_host_header = Some(true);
        }

        let labels = encode(&config, "traefik").unwrap();
        let decoded: Configuration = decode(&labels, "traefik", &["traefik.http"]).unwrap();
        assert_eq!(decoded, config);
    }
}
