//! Reference SQL for the NOTIFY triggers the invalidation bus (§4.3)
//! depends on. Schema migrations are out of scope (§1); this module exists
//! so the trigger bodies `fp-invalidation`'s listener contract assumes are
//! documented next to the tables that fire them, rather than only living
//! in a migration file nobody greps.

/// Installed on `gateway_configs`, `gateway_routes`, `gateway_auth_methods`,
/// and `route_auth_bindings`: any insert/update/delete notifies on the
/// shared `gateway_invalidated` channel with an empty payload (§4.3 —
/// gateway route-index rebuilds are cheap enough to always do a full
/// reload rather than track per-route dirty state).
pub const GATEWAY_NOTIFY_TRIGGER_SQL: &str = r#"
CREATE OR REPLACE FUNCTION fp_notify_gateway_invalidated() RETURNS trigger AS $$
BEGIN
  PERFORM pg_notify('gateway_invalidated', '');
  RETURN COALESCE(NEW, OLD);
END;
$$ LANGUAGE plpgsql;
"#;

/// Installed on `function_environment_variables` and
/// `network_policy_rules`: notifies on `execution_cache_invalidated` with a
/// JSON payload identifying which cache key to drop (§4.3's
/// `envvars:{function_id}` / `netpol:{project_id}` / `netpol:global` keys).
pub const EXECUTION_CACHE_NOTIFY_TRIGGER_SQL: &str = r#"
CREATE OR REPLACE FUNCTION fp_notify_execution_cache_invalidated() RETURNS trigger AS $$
DECLARE
  payload json;
BEGIN
  payload := CASE TG_TABLE_NAME
    WHEN 'function_environment_variables' THEN
      json_build_object('table', TG_TABLE_NAME, 'function_id', COALESCE(NEW.function_id, OLD.function_id))
    WHEN 'network_policy_rules' THEN
      json_build_object('table', TG_TABLE_NAME, 'project_id', COALESCE(NEW.project_id, OLD.project_id))
  END;
  PERFORM pg_notify('execution_cache_invalidated', payload::text);
  RETURN COALESCE(NEW, OLD);
END;
$$ LANGUAGE plpgsql;
"#;
