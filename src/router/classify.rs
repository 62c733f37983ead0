//! Request classification, evaluated in priority order.

use url::Url;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico"];
const SHELL_EXTENSIONS: &[&str] = &["html", "htm", "js", "mjs", "webmanifest"];

/// Serving strategy class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// Live data/auth/payment backends and CDN scripts: never cached
  NetworkOnly,
  /// Cache-first in the image partition
  Image,
  /// Network-first in the shell partition
  AppShell,
  /// Cache-first in the shell partition
  Static,
}

/// Whether `host` is one of `hosts` or a subdomain of one.
pub fn is_network_only_host(host: &str, hosts: &[String]) -> bool {
  let host = host.to_lowercase();
  hosts.iter().any(|h| {
    host == *h
      || host
        .strip_suffix(h.as_str())
        .is_some_and(|rest| rest.ends_with('.'))
  })
}

fn extension(url: &Url) -> Option<String> {
  let last = url.path_segments()?.next_back()?;
  let (_, ext) = last.rsplit_once('.')?;
  Some(ext.to_lowercase())
}

pub fn classify(url: &Url, network_only_hosts: &[String]) -> ResourceClass {
  if url
    .host_str()
    .is_some_and(|host| is_network_only_host(host, network_only_hosts))
  {
    return ResourceClass::NetworkOnly;
  }

  let ext = extension(url);
  if ext
    .as_deref()
    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e))
  {
    return ResourceClass::Image;
  }

  let is_root = url.path() == "/" || url.path().is_empty();
  let is_manifest = url.path().ends_with("/manifest.json");
  if is_root
    || is_manifest
    || ext
      .as_deref()
      .is_some_and(|e| SHELL_EXTENSIONS.contains(&e))
  {
    return ResourceClass::AppShell;
  }

  ResourceClass::Static
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hosts() -> Vec<String> {
    vec!["supabase.co".to_string(), "cdn.jsdelivr.net".to_string()]
  }

  fn class_of(url: &str) -> ResourceClass {
    classify(&Url::parse(url).unwrap(), &hosts())
  }

  #[test]
  fn test_backend_hosts_are_network_only() {
    assert_eq!(
      class_of("https://abc.supabase.co/rest/v1/products?select=*"),
      ResourceClass::NetworkOnly
    );
    assert_eq!(class_of("https://supabase.co/"), ResourceClass::NetworkOnly);
    // Network-only wins over the image rule
    assert_eq!(
      class_of("https://cdn.jsdelivr.net/npm/chart.js/logo.png"),
      ResourceClass::NetworkOnly
    );
  }

  #[test]
  fn test_suffix_match_needs_a_label_boundary() {
    assert!(!is_network_only_host("notsupabase.co", &hosts()));
    assert!(is_network_only_host("X.Supabase.Co", &hosts()));
  }

  #[test]
  fn test_images_by_extension() {
    assert_eq!(class_of("http://app/img/logo.PNG"), ResourceClass::Image);
    assert_eq!(class_of("http://app/favicon.ico"), ResourceClass::Image);
    assert_eq!(class_of("http://app/a.svg?v=2"), ResourceClass::Image);
  }

  #[test]
  fn test_app_shell() {
    assert_eq!(class_of("http://app/"), ResourceClass::AppShell);
    assert_eq!(class_of("http://app/sales.html"), ResourceClass::AppShell);
    assert_eq!(class_of("http://app/js/pos.js"), ResourceClass::AppShell);
    assert_eq!(class_of("http://app/manifest.json"), ResourceClass::AppShell);
  }

  #[test]
  fn test_everything_else_is_static() {
    assert_eq!(class_of("http://app/css/main.css"), ResourceClass::Static);
    assert_eq!(class_of("http://app/fonts/inter.woff2"), ResourceClass::Static);
    assert_eq!(class_of("http://app/reports"), ResourceClass::Static);
  }
}
