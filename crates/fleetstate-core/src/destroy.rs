//! Application destruction
//!
//! An application with no units and no relations (and, on CAAS, released
//! cluster resources) is removed in one transaction. Anything else is
//! marked Dying and the remaining work is queued as cleanup records; the
//! last unit or relation to go takes the application with it.

use std::sync::Arc;

use crate::application::{can_remove, remove_application_ops, Application, OFFERS_REF_KEY};
use crate::catalog::ResourceReleaser;
use crate::cleanup;
use crate::errors::{Result, StateError};
use crate::life::Life;
use crate::logged_op;
use crate::model::{CleanupKind, DocKey};
use crate::refcount;
use crate::settings::SettingsDrops;
use crate::state::{app_unchanged, offers_of, read_application};
use crate::txn::Op;

/// Builder for destroying one application
pub struct DestroyApplicationOperation {
    app: Application,
    /// Destroy units and relations without waiting for their agents
    pub force: bool,
    /// Remove offers of the application instead of refusing
    pub remove_offers: bool,
    /// Asked to release cluster resources when a CAAS application dies
    pub releaser: Option<Arc<dyn ResourceReleaser>>,
}

impl std::fmt::Debug for DestroyApplicationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestroyApplicationOperation")
            .field("application", &self.app.name())
            .field("force", &self.force)
            .field("remove_offers", &self.remove_offers)
            .field("releaser", &self.releaser.is_some())
            .finish()
    }
}

impl DestroyApplicationOperation {
    pub(crate) fn new(app: Application) -> Self {
        Self {
            app,
            force: false,
            remove_offers: false,
            releaser: None,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_remove_offers(mut self, remove_offers: bool) -> Self {
        self.remove_offers = remove_offers;
        self
    }

    pub fn with_releaser(mut self, releaser: Arc<dyn ResourceReleaser>) -> Self {
        self.releaser = Some(releaser);
        self
    }

    /// Destroy the application
    ///
    /// Destroying an application that is already gone, dead, or dying
    /// (without `force`) succeeds without doing anything.
    ///
    /// # Errors
    ///
    /// Returns `InUse` when offers exist and `remove_offers` is not set,
    /// plus any error from the resource releaser.
    pub fn run(&self) -> Result<()> {
        let name = self.app.name().to_string();
        logged_op!("destroy_application", name, {
            self.run_inner()
                .map_err(|e| e.annotate(format!("destroy application {:?}", name)))
        })
    }

    fn run_inner(&self) -> Result<()> {
        let st = self.app.state();
        let name = self.app.name();
        let mut release = false;

        st.run(|attempt| {
            release = false;
            let store = st.store();
            let app = match read_application(store, name) {
                Ok((doc, _)) => doc,
                Err(e) if e.is_not_found() => return Ok(vec![]),
                Err(e) => return Err(e),
            };
            match app.life {
                Life::Dead => return Ok(vec![]),
                Life::Dying if !self.force => return Ok(vec![]),
                _ => {}
            }

            let mut ops = Vec::new();
            let offers = offers_of(store, name);
            if !offers.is_empty() {
                if !self.remove_offers {
                    return Err(StateError::InUse {
                        message: format!(
                            "application is used by {} offer{}",
                            offers.len(),
                            if offers.len() == 1 { "" } else { "s" }
                        ),
                    });
                }
                for offer in &offers {
                    ops.push(Op::remove(DocKey::offer(&offer.name)));
                }
                let (dec, _) = refcount::decrement_by_op(
                    store,
                    name,
                    OFFERS_REF_KEY,
                    offers.len() as u64,
                    attempt,
                )?;
                ops.push(dec);
            }

            if can_remove(&app) {
                let mut drops = SettingsDrops::default();
                ops.push(Op::assert(DocKey::application(name), app_unchanged(&app)));
                ops.extend(remove_application_ops(store, &app, &mut drops));
                ops.extend(drops.into_ops(store, attempt)?);
                return Ok(ops);
            }

            ops.push(
                Op::update(DocKey::application(name), "life = dying", |doc| {
                    if let Some(app) = doc.as_application_mut() {
                        if Life::can_transition(app.life, Life::Dying) {
                            app.life = Life::Dying;
                        }
                    }
                })
                .when(app_unchanged(&app)),
            );
            if app.unit_count > 0 {
                ops.push(cleanup::queue_op(CleanupKind::DyingApplicationUnits {
                    application: name.to_string(),
                    force: self.force,
                }));
            }
            if app.relation_count > 0 {
                ops.push(cleanup::queue_op(CleanupKind::ApplicationRelations {
                    application: name.to_string(),
                    force: self.force,
                }));
            }
            release = app.caas.is_some();
            Ok(ops)
        })?;

        if release {
            if let Some(releaser) = &self.releaser {
                releaser.release(name)?;
            }
        }
        Ok(())
    }
}
