use crate::service::ServiceKey;

const DEFAULT_NAMESPACE: &str = "default";

/// Reduces a DNS name to the service it names.
///
/// `web` names `default/web`; `web.ns1` and longer forms such as `web.ns1.svc.cluster.local`
/// name `ns1/web`. A trailing root label is ignored.
pub fn split_service_domain(domain: &str) -> Option<ServiceKey> {
    let domain = domain.trim_end_matches('.');
    let mut labels = domain.split('.');
    let name = labels.next().filter(|n| !n.is_empty())?;
    let namespace = match labels.next() {
        Some(ns) if !ns.is_empty() => ns,
        Some(_) => return None,
        None => DEFAULT_NAMESPACE,
    };
    Some(ServiceKey::new(namespace, name))
}
