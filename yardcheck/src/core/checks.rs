//! Interpretation of captured remote output.

/// Trim `text` and bound it to `limit` bytes for a failure message.
pub fn fragment(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    let mut cut = limit;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{} [truncated {} bytes]",
        &trimmed[..cut],
        trimmed.len() - cut
    )
}

/// `ping` output reporting that every packet was lost.
pub fn total_packet_loss(output: &str) -> bool {
    output.contains("100% packet loss")
}

/// `nslookup` output carrying at least one resolved address.
pub fn resolved(output: &str) -> bool {
    output.contains("Address")
}

/// True when `name` appears as a whole line of a workload listing.
pub fn listing_contains(listing: &str, name: &str) -> bool {
    listing.lines().any(|line| line.trim() == name)
}

/// Interpret a `dir_probe` answer: `true` for `exists`, `false` for `gone`.
///
/// Anything else means the probe did not run as shaped and says nothing
/// about the directory.
pub fn dir_presence(output: &str) -> Result<bool, String> {
    match output.trim() {
        "exists" => Ok(true),
        "gone" => Ok(false),
        other => Err(format!("unexpected answer {other:?} from directory check")),
    }
}

/// Validate `stat -c '%a %G'` output for a control socket.
///
/// The octal mode must grant nothing to others and the owning group must be
/// the instance's own group.
pub fn check_socket_stat(output: &str, socket: &str, expected_group: &str) -> Result<(), String> {
    let parts: Vec<&str> = output.split_whitespace().collect();
    let [mode, group] = parts.as_slice() else {
        return Err(format!("unexpected stat output: {}", output.trim()));
    };
    if !mode.ends_with('0') {
        return Err(format!("socket {socket} is world-accessible (mode {mode})"));
    }
    if *group != expected_group {
        return Err(format!(
            "socket {socket} group is {group:?}, want {expected_group:?}"
        ));
    }
    Ok(())
}
