//! Variable substitution and minimal compose interpretation.
//!
//! The compose text is opaque to everything except the orchestrator, which
//! needs just enough structure out of it to pull images and create one
//! container per service, in declared order. Anything it does not
//! understand is ignored rather than rejected.

use std::collections::{BTreeMap, BTreeSet};

use hoster_core::{Error, Result};

/// One service extracted from the compose document, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeService {
    pub name: String,
    pub image: String,
    /// `KEY=value` pairs, from either the map or the list form.
    pub environment: Vec<String>,
    pub command: Option<Vec<String>>,
    /// Container-side port of the first `ports:` entry, used to route the
    /// proxy port to the primary service.
    pub container_port: Option<u16>,
    /// Raw volume specs (`source:/target[:mode]`). Only named-volume sources
    /// are honored downstream; host binds from tenant compose text are not.
    pub volumes: Vec<String>,
}

/// The named-volume source of a spec, if it is one. `/host:/path` binds and
/// relative paths return `None`.
pub fn named_volume_source(spec: &str) -> Option<&str> {
    let source = spec.split(':').next()?;
    (!source.is_empty() && !source.starts_with('/') && !source.starts_with('.'))
        .then_some(source)
}

/// Replace `${NAME}` references.
///
/// Grammar: only `${NAME}` is recognized; `$NAME` and `$$` pass through
/// untouched. A reference to a *declared required* variable with no value
/// fails with [`Error::MissingVariable`]; references to undeclared names
/// pass through so runtime-level interpolation keeps working.
pub fn substitute_variables(
    text: &str,
    values: &BTreeMap<String, String>,
    required: &BTreeSet<String>,
) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference; emit verbatim.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = &after[..end];
        match values.get(name) {
            Some(value) => out.push_str(value),
            None if required.contains(name) => {
                return Err(Error::MissingVariable {
                    name: name.to_string(),
                });
            }
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Extract the service list from a (post-substitution) compose document.
pub fn parse_services(compose: &str) -> Result<Vec<ComposeService>> {
    let doc: serde_yaml::Value = serde_yaml::from_str(compose)
        .map_err(|e| Error::validation("compose_spec", format!("invalid yaml: {e}")))?;
    let services = doc
        .get("services")
        .and_then(|s| s.as_mapping())
        .ok_or_else(|| Error::validation("compose_spec", "missing services map"))?;

    let mut out = Vec::with_capacity(services.len());
    for (name, body) in services {
        let name = name
            .as_str()
            .ok_or_else(|| Error::validation("compose_spec", "non-string service name"))?
            .to_string();
        let image = body
            .get("image")
            .and_then(|i| i.as_str())
            .ok_or_else(|| {
                Error::validation("compose_spec", format!("service {name} has no image"))
            })?
            .to_string();

        let environment = match body.get("environment") {
            Some(serde_yaml::Value::Mapping(map)) => map
                .iter()
                .filter_map(|(k, v)| {
                    let key = k.as_str()?;
                    Some(format!("{key}={}", yaml_scalar(v)))
                })
                .collect(),
            Some(serde_yaml::Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let command = match body.get("command") {
            Some(serde_yaml::Value::String(s)) => {
                Some(s.split_whitespace().map(ToString::to_string).collect())
            }
            Some(serde_yaml::Value::Sequence(seq)) => Some(
                seq.iter()
                    .map(|v| yaml_scalar(v))
                    .collect::<Vec<String>>(),
            ),
            _ => None,
        };

        let container_port = body
            .get("ports")
            .and_then(|p| p.as_sequence())
            .and_then(|seq| seq.first())
            .and_then(parse_container_port);

        let volumes = match body.get("volumes") {
            Some(serde_yaml::Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect(),
            _ => Vec::new(),
        };

        out.push(ComposeService {
            name,
            image,
            environment,
            command,
            container_port,
            volumes,
        });
    }
    if out.is_empty() {
        return Err(Error::validation("compose_spec", "no services declared"));
    }
    Ok(out)
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// `"8080"` exposes 8080; `"80:8080"` publishes host 80 → container 8080.
/// Either way the container side is the last component.
fn parse_container_port(value: &serde_yaml::Value) -> Option<u16> {
    let text = match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    text.rsplit(':').next()?.split('/').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_names() {
        let out = substitute_variables(
            "image: postgres:${PG_VERSION}\npassword: ${DB_PASSWORD}",
            &vars(&[("PG_VERSION", "16"), ("DB_PASSWORD", "hunter2")]),
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(out, "image: postgres:16\npassword: hunter2");
    }

    #[test]
    fn missing_required_variable_fails() {
        let required: BTreeSet<String> = ["DB_PASSWORD".to_string()].into();
        let err = substitute_variables("pw: ${DB_PASSWORD}", &BTreeMap::new(), &required)
            .unwrap_err();
        assert!(matches!(err, Error::MissingVariable { name } if name == "DB_PASSWORD"));
    }

    #[test]
    fn undeclared_references_pass_through() {
        let out =
            substitute_variables("a: ${RUNTIME_ONLY}", &BTreeMap::new(), &BTreeSet::new())
                .unwrap();
        assert_eq!(out, "a: ${RUNTIME_ONLY}");
    }

    #[test]
    fn dollar_dollar_is_not_an_escape() {
        let out = substitute_variables("price: $$5 and ${X}", &vars(&[("X", "y")]), &BTreeSet::new())
            .unwrap();
        assert_eq!(out, "price: $$5 and y");
    }

    #[test]
    fn unterminated_reference_left_verbatim() {
        let out = substitute_variables("broken: ${OOPS", &BTreeMap::new(), &BTreeSet::new())
            .unwrap();
        assert_eq!(out, "broken: ${OOPS");
    }

    #[test]
    fn parses_services_in_declared_order() {
        let compose = r"
services:
  db:
    image: postgres:16
    environment:
      POSTGRES_PASSWORD: hunter2
    volumes:
      - pgdata:/var/lib/postgresql/data
  web:
    image: nginx:alpine
    ports:
      - '8080:80'
    environment:
      - UPSTREAM=db
";
        let services = parse_services(compose).unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "db");
        assert_eq!(services[0].image, "postgres:16");
        assert_eq!(services[0].environment, vec!["POSTGRES_PASSWORD=hunter2"]);
        assert_eq!(services[0].volumes, vec!["pgdata:/var/lib/postgresql/data"]);
        assert_eq!(
            named_volume_source(&services[0].volumes[0]),
            Some("pgdata")
        );
        assert_eq!(named_volume_source("/etc:/etc:ro"), None);
        assert_eq!(named_volume_source("./data:/data"), None);
        assert_eq!(services[1].name, "web");
        assert_eq!(services[1].container_port, Some(80));
        assert_eq!(services[1].environment, vec!["UPSTREAM=db"]);
    }

    #[test]
    fn service_without_image_rejected() {
        let err = parse_services("services:\n  web:\n    build: .\n").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn bare_port_number() {
        let compose = "services:\n  web:\n    image: nginx:alpine\n    ports:\n      - 8080\n";
        let services = parse_services(compose).unwrap();
        assert_eq!(services[0].container_port, Some(8080));
    }

    #[test]
    fn empty_document_rejected() {
        assert!(parse_services("").is_err());
        assert!(parse_services("services: {}").is_err());
    }
}
