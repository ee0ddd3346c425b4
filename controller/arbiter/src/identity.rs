use patchbay_controller_core::{
    Client, Exporter, Kind, ObjectMeta, Resource, Secret, Selector, Subject,
};
use patchbay_controller_store::{Error, Event, Stores};
use patchbay_controller_token::IdentitySigner;
use std::sync::Arc;
use tracing::{info, warn};

/// Keeps every exporter and client resource provisioned with exactly one
/// issued credential: a secret holding the signed identity token, named
/// from the resource's status. Deleting the resource collects the secret.
#[derive(Clone)]
pub struct IdentityReconciler {
    stores: Stores,
    signer: Arc<IdentitySigner>,
}

impl IdentityReconciler {
    pub fn new(stores: Stores, signer: Arc<IdentitySigner>) -> Self {
        Self { stores, signer }
    }

    pub async fn run(self, drain: drain::Watch) -> anyhow::Result<()> {
        let (exporters, mut exporter_watch) =
            self.stores.exporters().list_and_watch(Selector::default());
        let (clients, mut client_watch) =
            self.stores.clients().list_and_watch(Selector::default());

        for exporter in exporters {
            self.provision_exporter(&exporter);
        }
        for client in clients {
            self.provision_client(&client);
        }

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = (&mut shutdown) => return Ok(()),
                event = exporter_watch.next() => match event {
                    Ok(Event::Added(exporter) | Event::Modified(exporter)) => {
                        self.provision_exporter(&exporter);
                    }
                    Ok(Event::Deleted(exporter)) => {
                        self.collect(exporter.status.credential_ref.as_deref());
                    }
                    Err(error) => {
                        warn!(%error, "exporter watch expired, restarting");
                        let (exporters, watch) =
                            self.stores.exporters().list_and_watch(Selector::default());
                        for exporter in exporters {
                            self.provision_exporter(&exporter);
                        }
                        exporter_watch = watch;
                    }
                },
                event = client_watch.next() => match event {
                    Ok(Event::Added(client) | Event::Modified(client)) => {
                        self.provision_client(&client);
                    }
                    Ok(Event::Deleted(client)) => {
                        self.collect(client.status.credential_ref.as_deref());
                    }
                    Err(error) => {
                        warn!(%error, "client watch expired, restarting");
                        let (clients, watch) =
                            self.stores.clients().list_and_watch(Selector::default());
                        for client in clients {
                            self.provision_client(&client);
                        }
                        client_watch = watch;
                    }
                },
            }
        }
    }

    fn provision_exporter(&self, exporter: &Exporter) {
        if exporter.status.credential_ref.is_some() {
            return;
        }
        let result = self.issue(&exporter.subject()).and_then(|secret| {
            let mut updated = exporter.clone();
            updated.status.credential_ref = Some(secret);
            self.stores.exporters().update_status(updated).map(|_| ())
        });
        if let Err(error) = result {
            warn!(exporter = %exporter.name(), %error, "failed to provision credential");
        }
    }

    fn provision_client(&self, client: &Client) {
        if client.status.credential_ref.is_some() {
            return;
        }
        let result = self.issue(&client.subject()).and_then(|secret| {
            let mut updated = client.clone();
            updated.status.credential_ref = Some(secret);
            self.stores.clients().update_status(updated).map(|_| ())
        });
        if let Err(error) = result {
            warn!(client = %client.name(), %error, "failed to provision credential");
        }
    }

    /// Mints an identity token and stores it as a secret; returns the
    /// secret's name.
    fn issue(&self, subject: &Subject) -> Result<String, Error> {
        let token = self.signer.mint(subject).map_err(|e| Error::Invalid {
            kind: Kind::Secret,
            reason: format!("failed to mint identity token: {e}"),
        })?;

        let name = credential_name(subject);
        let secret = Secret {
            metadata: ObjectMeta::named("", name.clone()),
            data: token.into_bytes(),
        };
        match self.stores.secrets().create(secret) {
            Ok(_) => {
                info!(subject = %subject, secret = %name, "issued credential");
                Ok(name)
            }
            // A previous run already issued it; the token is still valid
            // because the key derives from the same seed.
            Err(Error::AlreadyExists { .. }) => Ok(name),
            Err(error) => Err(error),
        }
    }

    fn collect(&self, credential_ref: Option<&str>) {
        let Some(name) = credential_ref else { return };
        match self.stores.secrets().delete(name, None) {
            Ok(_) => info!(secret = %name, "collected credential"),
            Err(error) if error.is_not_found() => {}
            Err(error) => warn!(secret = %name, %error, "failed to collect credential"),
        }
    }
}

fn credential_name(subject: &Subject) -> String {
    format!("{}-{}-credential", subject.kind, subject.name)
}

impl std::fmt::Debug for IdentityReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityReconciler").finish_non_exhaustive()
    }
}
