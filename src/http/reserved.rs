//! Static content for the reserved paths.
//!
//! These five paths can never host a rendezvous (`spec.md` §3): `/`,
//! `/version`, `/help`, `/favicon.ico`, `/robots.txt`. Everything here is
//! computed once per request from fixed or near-fixed inputs — there is no
//! state to protect, unlike the registry.

pub(crate) const RESERVED_PATHS: [&str; 5] =
    ["/", "/version", "/help", "/favicon.ico", "/robots.txt"];

pub(crate) fn is_reserved(path: &str) -> bool {
    RESERVED_PATHS.contains(&path)
}

pub(crate) fn index_html() -> String {
    format!(
        "<!doctype html>\n\
         <html lang=\"en\">\n\
         <head><meta charset=\"utf-8\"><title>rendezvous-relay</title></head>\n\
         <body>\n\
         <h1>rendezvous-relay</h1>\n\
         <p>A streaming HTTP rendezvous relay. See <a href=\"/help\">/help</a> for usage.</p>\n\
         <p>version {}</p>\n\
         </body>\n\
         </html>\n",
        env!("CARGO_PKG_VERSION")
    )
}

pub(crate) fn version_text() -> String {
    format!("{}\n", env!("CARGO_PKG_VERSION"))
}

/// Generates the `/help` page body from the scheme and host a client should
/// use to reach this server, per `spec.md` §4.3.
pub(crate) fn help_text(scheme: &str, host: &str) -> String {
    let base = format!("{scheme}://{host}");
    format!(
        "rendezvous-relay — streaming HTTP rendezvous relay\n\
         \n\
         [How to use]\n\
         \n\
         Step 1: Decide a path, e.g. {base}/mypath123\n\
         \n\
         Step 2: Send your data from one sender:\n\
         curl -T myfile.txt {base}/mypath123\n\
         \n\
         Step 3: Receive it from one or more receivers:\n\
         curl {base}/mypath123\n\
         \n\
         [Multiple receivers]\n\
         \n\
         Append ?n=<count> to both the sender and every receiver's URL to\n\
         require that many receivers before the transfer starts, e.g.\n\
         {base}/mypath123?n=2\n\
         \n\
         [Notes]\n\
         \n\
         Nothing is stored: bytes are streamed directly from the sender to\n\
         every receiver as they arrive. A path can only be used by one\n\
         sender/receiver set at a time; once a transfer finishes the path is\n\
         free again.\n"
    )
}
