use crate::Error;
use patchbay_controller_core::{Client, Exporter, Kind, Resource, Selector, Subject};
use patchbay_controller_store::Stores;
use tracing::trace;

/// The resource an authenticated subject resolved to.
#[derive(Clone, Debug)]
pub enum Identity {
    Exporter(Exporter),
    Client(Client),
}

/// Maps authenticated subjects onto exporter and client resources.
///
/// Subjects under the internal prefix carry their canonical resource name
/// directly; anything else is matched against the `username` overrides on
/// resource specs.
#[derive(Clone, Debug)]
pub struct Authorizer {
    prefix: String,
    stores: Stores,
}

impl Authorizer {
    pub fn new(prefix: impl Into<String>, stores: Stores) -> Self {
        Self {
            prefix: prefix.into(),
            stores,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn resolve(&self, subject: &str) -> Result<Identity, Error> {
        let denied = || Error::PermissionDenied(format!("subject {subject:?} is not mapped"));

        if let Some(canonical) = subject.strip_prefix(&self.prefix) {
            let parsed = canonical.parse::<Subject>().map_err(|error| {
                trace!(%subject, %error, "unparseable internal subject");
                denied()
            })?;
            if parsed.namespace != self.stores.namespace() {
                return Err(Error::PermissionDenied(format!(
                    "subject {subject:?} is outside namespace {:?}",
                    self.stores.namespace()
                )));
            }
            return match parsed.kind {
                Kind::Exporter => self
                    .stores
                    .exporters()
                    .get(&parsed.name)
                    .map(Identity::Exporter)
                    .map_err(|_| denied()),
                Kind::Client => self
                    .stores
                    .clients()
                    .get(&parsed.name)
                    .map(Identity::Client)
                    .map_err(|_| denied()),
                _ => Err(denied()),
            };
        }

        // Externally-issued subject: look for a username override.
        let everything = Selector::default();
        if let Some(client) = self
            .stores
            .clients()
            .list(&everything)
            .into_iter()
            .find(|c| c.spec.username.as_deref() == Some(subject))
        {
            return Ok(Identity::Client(client));
        }
        if let Some(exporter) = self
            .stores
            .exporters()
            .list(&everything)
            .into_iter()
            .find(|e| e.spec.username.as_deref() == Some(subject))
        {
            return Ok(Identity::Exporter(exporter));
        }
        Err(denied())
    }

    /// Resolves a subject that must be an exporter.
    pub fn exporter(&self, subject: &str) -> Result<Exporter, Error> {
        match self.resolve(subject)? {
            Identity::Exporter(exporter) => Ok(exporter),
            Identity::Client(client) => Err(Error::PermissionDenied(format!(
                "client {:?} may not act as an exporter",
                client.name()
            ))),
        }
    }

    /// Resolves a subject that must be a client.
    pub fn client(&self, subject: &str) -> Result<Client, Error> {
        match self.resolve(subject)? {
            Identity::Client(client) => Ok(client),
            Identity::Exporter(exporter) => Err(Error::PermissionDenied(format!(
                "exporter {:?} may not act as a client",
                exporter.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_controller_core::{ClientSpec, ExporterSpec, ObjectMeta, DEFAULT_INTERNAL_PREFIX};

    fn stores() -> Stores {
        let stores = Stores::new("default");
        stores
            .exporters()
            .create(Exporter {
                metadata: ObjectMeta::named("", "e1"),
                spec: ExporterSpec {
                    username: Some("exporter-bot@example.com".to_string()),
                },
                ..Default::default()
            })
            .unwrap();
        stores
            .clients()
            .create(Client {
                metadata: ObjectMeta::named("", "c1"),
                spec: ClientSpec {
                    username: Some("alice@example.com".to_string()),
                },
                ..Default::default()
            })
            .unwrap();
        stores
    }

    fn authorizer() -> Authorizer {
        Authorizer::new(DEFAULT_INTERNAL_PREFIX, stores())
    }

    #[test]
    fn resolves_internal_subjects() {
        let authorizer = authorizer();
        let exporter = authorizer.exporter("internal:default/exporter/e1").unwrap();
        assert_eq!(exporter.name(), "e1");
        let client = authorizer.client("internal:default/client/c1").unwrap();
        assert_eq!(client.name(), "c1");
    }

    #[test]
    fn resolves_username_overrides() {
        let authorizer = authorizer();
        assert!(matches!(
            authorizer.resolve("alice@example.com").unwrap(),
            Identity::Client(_)
        ));
        assert!(matches!(
            authorizer.resolve("exporter-bot@example.com").unwrap(),
            Identity::Exporter(_)
        ));
    }

    #[test]
    fn kind_mismatch_is_denied() {
        let authorizer = authorizer();
        assert!(matches!(
            authorizer.client("internal:default/exporter/e1"),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            authorizer.exporter("internal:default/client/c1"),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn unknown_subjects_are_denied() {
        let authorizer = authorizer();
        assert!(matches!(
            authorizer.resolve("internal:default/exporter/missing"),
            Err(Error::PermissionDenied(_))
        ));
        assert!(matches!(
            authorizer.resolve("mallory@example.com"),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn foreign_namespace_is_denied() {
        let authorizer = authorizer();
        assert!(matches!(
            authorizer.resolve("internal:other/exporter/e1"),
            Err(Error::PermissionDenied(_))
        ));
    }
}
