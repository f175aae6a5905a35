//! Per-cluster AVI users.
//!
//! Every workload cluster gets its own AVI user bound to the AKO role in the
//! ADC's tenant. The credentials live in a secret next to the cluster in the
//! management cluster, which is the source of truth for the password.

use std::collections::BTreeMap;

use futures::{FutureExt, future::BoxFuture};
use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams},
};
use serde_json::json;
use tracing::*;

use crate::{
    Error, Result,
    avi::{AviClient, ControllerVersion, Role, User, UserRole},
    crd::{
        AKODeploymentConfig, AVI_CERTIFICATE_KEY, AVI_CLUSTER_SECRET_TYPE, AVI_NAMESPACE,
        AVI_PASSWORD_KEY, AVI_RESOURCE_CLEANUP_SUCCEEDED, AVI_SECRET_NAME,
        AVI_USER_CLEANUP_SUCCEEDED, AVI_USERNAME_KEY, Cluster, MANAGER_NAME, TKG_SYSTEM_NAMESPACE,
    },
    events_helper::emit_info,
    helper,
    phases::{PhaseContext, ReconcileResult},
    remote,
    values::AviCredentials,
};

mod password;
mod role;

pub use password::*;
pub use role::*;

/// First controller version whose user records carry a separate `username`
pub const USERNAME_FIELD_SINCE: [u32; 3] = [21, 1, 4];

pub fn avi_username(cluster: &Cluster) -> String {
    format!(
        "{}-{}-ako-user",
        cluster.name_any(),
        cluster.namespace().unwrap_or_default()
    )
}

/// Credentials are generated by the operator unless the ADC names a secret.
pub fn is_auto_managed(adc: &AKODeploymentConfig) -> bool {
    adc.spec
        .workload_credential_ref
        .as_ref()
        .is_none_or(|r| r.name.is_empty())
}

/// `(name, namespace)` of the management-side credentials secret of a cluster.
pub fn credentials_secret_key(adc: &AKODeploymentConfig, cluster: &Cluster) -> (String, String) {
    let cluster_ns = cluster.namespace().unwrap_or_default();
    match adc.spec.workload_credential_ref.as_ref() {
        Some(r) if !r.name.is_empty() => {
            let ns = if r.namespace.is_empty() { cluster_ns } else { r.namespace.clone() };
            (r.name.clone(), ns)
        }
        _ => (format!("{}-avi-credentials", cluster.name_any()), cluster_ns),
    }
}

fn credential_data(username: &str, password: &str, ca: &str) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (AVI_USERNAME_KEY.to_string(), ByteString(username.as_bytes().to_vec())),
        (AVI_PASSWORD_KEY.to_string(), ByteString(password.as_bytes().to_vec())),
        (AVI_CERTIFICATE_KEY.to_string(), ByteString(ca.as_bytes().to_vec())),
    ])
}

/// Credentials secret in the management cluster, owned by the ADC.
pub fn credentials_secret(
    adc: &AKODeploymentConfig,
    name: &str,
    namespace: &str,
    username: &str,
    password: &str,
    ca: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: adc.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        type_: Some(AVI_CLUSTER_SECRET_TYPE.to_string()),
        data: Some(credential_data(username, password, ca)),
        ..Secret::default()
    }
}

/// Version used to tailor role and user records; `spec.controllerVersion` wins over detection.
pub async fn controller_version(
    avi: &dyn AviClient,
    adc: &AKODeploymentConfig,
) -> Option<ControllerVersion> {
    let raw = match adc.spec.controller_version.as_deref().filter(|v| !v.is_empty()) {
        Some(v) => v.to_string(),
        None => match avi.controller_version().await {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to detect AVI controller version: {e}");
                return None;
            }
        },
    };
    raw.parse()
        .inspect_err(|e| warn!("ignoring controller version: {e}"))
        .ok()
}

/// Creates the AKO role in the tenant or corrects drift in its privileges.
pub async fn ensure_role(
    avi: &dyn AviClient,
    tenant_ref: Option<String>,
    version: Option<&ControllerVersion>,
) -> Result<Role> {
    let desired = role_permissions(version);
    let existing = match avi.role_get_by_name(AKO_ROLE_NAME).await {
        Ok(role) => Some(role),
        Err(e) if e.is_role_not_found() || e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    let Some(mut role) = existing else {
        let role = Role {
            name: AKO_ROLE_NAME.to_string(),
            tenant_ref,
            privileges: desired,
            ..Role::default()
        };
        return match avi.role_create(&role).await {
            Ok(created) => {
                info!(role = AKO_ROLE_NAME, "AVI role created");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => Ok(avi.role_get_by_name(AKO_ROLE_NAME).await?),
            Err(e) => Err(e.into()),
        };
    };

    if reconcile_privileges(&mut role.privileges, &desired, version) {
        info!(role = AKO_ROLE_NAME, "AVI role privileges drifted, updating");
        return Ok(avi.role_update(&role).await?);
    }
    Ok(role)
}

/// Makes sure the AVI user exists in `tenant` with the given password.
///
/// Returns the user and whether it was created.
pub async fn ensure_user(
    avi: &dyn AviClient,
    tenant: &str,
    username: &str,
    password: &str,
    version: Option<&ControllerVersion>,
) -> Result<(User, bool)> {
    let tenant = match avi.tenant_get(tenant).await {
        Ok(t) => t,
        Err(e) if e.is_not_found() => {
            return Err(Error::Fatal(format!("AVI tenant {tenant} does not exist")));
        }
        Err(e) => return Err(e.into()),
    };
    let role = ensure_role(avi, tenant.url.clone(), version).await?;
    let with_username = version.is_some_and(|v| *v >= ControllerVersion::new(&USERNAME_FIELD_SINCE));

    let existing = match avi.user_get_by_name(username).await {
        Ok(user) => Some(user),
        Err(e) if e.is_user_not_found() || e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    let mut user = match existing {
        Some(user) => user,
        None => {
            let user = User {
                name: username.to_string(),
                username: with_username.then(|| username.to_string()),
                password: Some(password.to_string()),
                default_tenant_ref: tenant.url.clone(),
                access: vec![UserRole {
                    tenant_ref: tenant.url.clone(),
                    role_ref: role.url.clone(),
                    all_tenants: Some(false),
                }],
                ..User::default()
            };
            match avi.user_create(&user).await {
                Ok(created) => {
                    info!(user = %username, "AVI user created");
                    return Ok((created, true));
                }
                Err(e) if e.is_already_exists() => avi.user_get_by_name(username).await?,
                Err(e) => return Err(e.into()),
            }
        }
    };

    let mut changed = false;
    if user.password.as_deref() != Some(password) {
        user.password = Some(password.to_string());
        changed = true;
    }
    if with_username && user.username.as_deref() != Some(username) {
        user.username = Some(username.to_string());
        changed = true;
    }
    if changed {
        debug!(user = %username, "syncing AVI user with the credentials secret");
        user = avi.user_update(&user).await?;
    }
    Ok((user, false))
}

/// Deletes the AVI user; a user that is already gone counts as deleted.
pub async fn delete_user(avi: &dyn AviClient, username: &str) -> Result<()> {
    match avi.user_delete_by_name(username).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() || e.is_user_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Reads the credentials secret, creating it with fresh credentials when absent
/// and refreshing its CA otherwise. Returns `(username, password)`.
async fn ensure_credentials_secret(
    client: &Client,
    adc: &AKODeploymentConfig,
    cluster: &Cluster,
    ca: &str,
) -> Result<(String, String)> {
    let (name, namespace) = credentials_secret_key(adc, cluster);
    let api: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let secret = match api.get_opt(&name).await.map_err(Error::KubeError)? {
        Some(s) => s,
        None => {
            let username = avi_username(cluster);
            let password = generate_password(PASSWORD_LENGTH);
            let secret = credentials_secret(adc, &name, &namespace, &username, &password, ca);
            match api.create(&PostParams::default(), &secret).await {
                Ok(_) => {
                    info!(secret = %format!("{namespace}/{name}"), "AVI user credentials secret created");
                    return Ok((username, password));
                }
                // someone raced us; their password wins
                Err(kube::Error::Api(resp)) if resp.code == 409 => {
                    api.get(&name).await.map_err(Error::KubeError)?
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
    };

    let username = helper::secret_string(&secret, AVI_USERNAME_KEY)?;
    let password = helper::secret_string(&secret, AVI_PASSWORD_KEY)?;
    let current_ca = helper::secret_string(&secret, AVI_CERTIFICATE_KEY).unwrap_or_default();
    if current_ca != ca {
        let patch = json!({ "stringData": { AVI_CERTIFICATE_KEY: ca } });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
        debug!(secret = %format!("{namespace}/{name}"), "refreshed certificate authority data");
    }
    Ok((username, password))
}

/// Writes the admin credentials as `avi-secret` into the target cluster's AVI namespace.
async fn ensure_management_avi_secret(
    ctx: &PhaseContext,
    adc: &AKODeploymentConfig,
    cluster: &Cluster,
) -> Result<()> {
    let (username, password) = helper::admin_credentials(&ctx.client, adc).await?;
    let ca = helper::controller_ca(&ctx.client, adc).await?;
    let remote = remote::workload_client(
        &ctx.client,
        &cluster.namespace().unwrap_or_default(),
        &cluster.name_any(),
    )
    .await?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(AVI_SECRET_NAME.to_string()),
            namespace: Some(AVI_NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        type_: Some(AVI_CLUSTER_SECRET_TYPE.to_string()),
        data: Some(credential_data(&username, &password, &ca)),
        ..Secret::default()
    };
    Api::<Secret>::namespaced(remote, AVI_NAMESPACE)
        .patch(
            AVI_SECRET_NAME,
            &PatchParams::apply(MANAGER_NAME).force(),
            &Patch::Apply(&secret),
        )
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Credentials AKO on `cluster` authenticates with.
///
/// The management cluster uses the admin account; workload clusters use the
/// per-cluster user, whose secret must already exist.
pub async fn cluster_credentials(
    client: &Client,
    adc: &AKODeploymentConfig,
    cluster: &Cluster,
) -> Result<AviCredentials> {
    let ca = helper::controller_ca(client, adc).await?;
    if cluster.namespace().as_deref() == Some(TKG_SYSTEM_NAMESPACE) {
        let (username, password) = helper::admin_credentials(client, adc).await?;
        return Ok(AviCredentials {
            username,
            password,
            certificate_authority_data: ca,
        });
    }
    let (name, namespace) = credentials_secret_key(adc, cluster);
    let secret = helper::get_secret_opt(client, &namespace, &name)
        .await?
        .ok_or_else(|| {
            Error::PreconditionNotMet(format!("AVI credentials secret {namespace}/{name}"))
        })?;
    Ok(AviCredentials {
        username: helper::secret_string(&secret, AVI_USERNAME_KEY)?,
        password: helper::secret_string(&secret, AVI_PASSWORD_KEY)?,
        certificate_authority_data: ca,
    })
}

/// Cluster phase: credentials secret plus AVI user and role for a workload cluster.
pub fn reconcile_avi_user<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
    cluster: &'a mut Cluster,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let name = cluster.namespaced_name();
        if cluster.namespace().as_deref() == Some(TKG_SYSTEM_NAMESPACE) {
            ensure_management_avi_secret(ctx, adc, cluster).await?;
            debug!(cluster = %name, "management cluster uses the admin credentials");
            return Ok(ReconcileResult::done());
        }
        if !is_auto_managed(adc) {
            debug!(cluster = %name, "workload credentials are provided, skipping AVI user");
            return Ok(ReconcileResult::done());
        }

        let ca = helper::controller_ca(&ctx.client, adc).await?;
        let (username, password) = ensure_credentials_secret(&ctx.client, adc, cluster, &ca).await?;

        let avi = ctx.avi_client(adc).await?;
        let version = controller_version(avi.as_ref(), adc).await;
        let (_, created) = ensure_user(
            avi.as_ref(),
            adc.tenant_name(),
            &username,
            &password,
            version.as_ref(),
        )
        .await?;
        if created {
            emit_info(
                &ctx.recorder,
                adc,
                "AviUserCreated",
                "CreateAviUser",
                Some(format!("AVI user {username} created for cluster {name}")),
            )
            .await;
        }
        Ok(ReconcileResult::done())
    }
    .boxed()
}

/// Cluster phase: removes the AVI user and its secret once AKO has drained its objects.
pub fn reconcile_avi_user_delete<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
    cluster: &'a mut Cluster,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let name = cluster.namespaced_name();
        if cluster.is_condition_true(AVI_USER_CLEANUP_SUCCEEDED) {
            return Ok(ReconcileResult::done());
        }
        if cluster.namespace().as_deref() == Some(TKG_SYSTEM_NAMESPACE) || !is_auto_managed(adc) {
            cluster.mark_true(AVI_USER_CLEANUP_SUCCEEDED);
            return Ok(ReconcileResult::done());
        }
        if !cluster.is_condition_true(AVI_RESOURCE_CLEANUP_SUCCEEDED) {
            debug!(cluster = %name, "waiting for AKO to finish its cleanup before deleting the AVI user");
            return Ok(ReconcileResult::done());
        }

        let (secret_name, namespace) = credentials_secret_key(adc, cluster);
        let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
        let Some(secret) = api.get_opt(&secret_name).await.map_err(Error::KubeError)? else {
            info!(cluster = %name, "AVI credentials secret already gone");
            cluster.mark_true(AVI_USER_CLEANUP_SUCCEEDED);
            return Ok(ReconcileResult::done());
        };

        let username = helper::secret_string(&secret, AVI_USERNAME_KEY)?;
        let avi = ctx.avi_client(adc).await?;
        delete_user(avi.as_ref(), &username).await?;
        match api.delete(&secret_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
        info!(cluster = %name, user = %username, "AVI user deleted");
        cluster.mark_true(AVI_USER_CLEANUP_SUCCEEDED);
        Ok(ReconcileResult::done())
    }
    .boxed()
}
