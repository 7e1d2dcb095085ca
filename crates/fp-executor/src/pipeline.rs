// SPDX-License-Identifier: MIT OR Apache-2.0
//! The pre-invocation pipeline (§4.4 steps 1-5): metadata lookup,
//! admission, package resolution, environment, and policy load, run in
//! order against the engine's caches and backing stores. Any step's
//! failure short-circuits the remaining steps and becomes the
//! invocation's terminal error (§4.4 "Post-invocation").

use crate::cache::{CachedFunction, ExecutorCache};
use crate::error::ExecutionError;
use crate::{admission, egress};
use fp_cache::{CacheKey, PackageCache, ResolvedPackage};
use fp_core::{Function, FunctionEnvironmentVariable, NetworkPolicyRule};
use fp_sandbox::Request;
use fp_store::MetadataStore;
use std::sync::Arc;
use uuid::Uuid;

/// Everything the pipeline resolved about one invocation before dispatch.
pub struct PreparedInvocation {
    /// The function being invoked.
    pub function: Function,
    /// The resolved, extracted package on local disk. Kept alive for the
    /// lifetime of the invocation — its `Drop` releases the package
    /// cache's reader count (§4.1).
    pub package: ResolvedPackage,
    /// The function's configured environment variables (§4.4 step 4).
    pub env_vars: Arc<Vec<FunctionEnvironmentVariable>>,
    /// Merged project + global network policy rules, in evaluation order
    /// (§4.4 step 5, §4.5).
    pub policy_rules: Arc<Vec<NetworkPolicyRule>>,
}

/// Step 1: resolve the function and its active version's package hash,
/// cache-through via `cache`.
pub async fn lookup_function(
    store: &MetadataStore,
    cache: &ExecutorCache,
    function_id: Uuid,
) -> Result<Arc<CachedFunction>, ExecutionError> {
    if let Some(cached) = cache.get_function(function_id) {
        return Ok(cached);
    }

    let function = store.get_function(function_id).await?;
    if !function.active {
        return Err(ExecutionError::FunctionNotFound);
    }
    let active_version = store.get_active_version(&function).await?;
    let package_hash = active_version.map(|v| v.package_hash);

    let cached = Arc::new(CachedFunction {
        function,
        package_hash,
    });
    cache.put_function(function_id, cached.clone());
    Ok(cached)
}

/// Step 2 (§4.4, §8 testable property 7): if the function requires an API
/// key, the presented credential must hash-match in constant time.
pub fn admit(function: &Function, request: &Request) -> Result<(), ExecutionError> {
    if !function.requires_api_key {
        return Ok(());
    }
    let Some(expected) = function.api_key_hash.as_deref() else {
        // Misconfigured: `requires_api_key` set with no stored hash can
        // never be satisfied.
        return Err(ExecutionError::Unauthorized);
    };
    let presented = admission::extract_presented_key(request).ok_or(ExecutionError::Unauthorized)?;
    let hashed = admission::sha256_hex(presented);
    if admission::constant_time_eq(&hashed, expected) {
        Ok(())
    } else {
        Err(ExecutionError::Unauthorized)
    }
}

/// Step 3 (§4.1): fetch, verify, and extract the active version's package,
/// reusing an already-materialized cache entry when present.
pub async fn resolve_package(
    package_cache: &PackageCache,
    function_id: Uuid,
    package_hash: &str,
) -> Result<ResolvedPackage, ExecutionError> {
    let key = CacheKey::new(function_id.to_string(), package_hash.to_string());
    package_cache.resolve(&key).await.map_err(ExecutionError::from)
}

/// Step 4 (§4.4): the function's environment variables, cache-through.
pub async fn load_env_vars(
    store: &MetadataStore,
    cache: &ExecutorCache,
    function_id: Uuid,
) -> Result<Arc<Vec<FunctionEnvironmentVariable>>, ExecutionError> {
    if let Some(cached) = cache.get_env_vars(function_id) {
        return Ok(cached);
    }
    let vars = Arc::new(store.get_env_vars(function_id).await?);
    cache.put_env_vars(function_id, vars.clone());
    Ok(vars)
}

/// Step 5 (§4.4, §4.5): the merged project + global network policy rule
/// set this invocation's egress is checked against, cache-through with
/// independent invalidation scopes for the project and global slots.
pub async fn load_policy_rules(
    store: &MetadataStore,
    cache: &ExecutorCache,
    project_id: Uuid,
) -> Result<Arc<Vec<NetworkPolicyRule>>, ExecutionError> {
    let project_rules = match cache.get_project_policies(project_id) {
        Some(cached) => cached,
        None => {
            let rules = Arc::new(store.get_project_network_policies(project_id).await?);
            cache.put_project_policies(project_id, rules.clone());
            rules
        }
    };

    let global_rules = match crate::cache::get_global_policies(cache) {
        Some(cached) => cached,
        None => {
            let rules = Arc::new(store.get_global_network_policies().await?);
            crate::cache::put_global_policies(cache, rules.clone());
            rules
        }
    };

    Ok(Arc::new(fp_store::policy::merge_policies(
        &project_rules,
        &global_rules,
    )))
}

/// Run all five pre-invocation steps and assemble a [`PreparedInvocation`].
pub async fn prepare(
    store: &MetadataStore,
    cache: &ExecutorCache,
    package_cache: &PackageCache,
    function_id: Uuid,
    request: &Request,
) -> Result<PreparedInvocation, ExecutionError> {
    let cached_function = lookup_function(store, cache, function_id).await?;
    admit(&cached_function.function, request)?;

    let Some(package_hash) = cached_function.package_hash.as_deref() else {
        return Err(ExecutionError::FunctionNotFound);
    };
    let package = resolve_package(package_cache, function_id, package_hash).await?;
    let env_vars = load_env_vars(store, cache, function_id).await?;
    let policy_rules =
        load_policy_rules(store, cache, cached_function.function.project_id).await?;

    Ok(PreparedInvocation {
        function: cached_function.function.clone(),
        package,
        env_vars,
        policy_rules,
    })
}

/// Check a handler's outbound connection attempt against a prepared
/// invocation's merged policy set (§4.4 "Network egress guard").
pub async fn check_egress(
    prepared: &PreparedInvocation,
    host: &str,
    port: u16,
) -> Result<(), egress::EgressError> {
    egress::check_egress(&prepared.policy_rules, host, port).await
}
