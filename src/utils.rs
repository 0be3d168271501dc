
// 10 is ASCII newline
const LINE_SEPARATOR: u8 = 10;

/// Pull every *complete* line out of `buf`, leaving any unfinished tail in
/// place for the next read to extend.  A carriage return just before the
/// newline is dropped, since telnet-ish clients send \r\n.
pub fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(pos) = buf.iter().position(|b| *b == LINE_SEPARATOR) {
        let mut line: Vec<u8> = buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }

    lines
}

/// Strip control characters out of text that arrived over the wire and trim
/// the ends.  Anything we pass along to other connections goes through here
/// first, so nobody can smuggle escape sequences onto someone's terminal.
pub fn scrub(text: &str) -> String {
    let kept: String = text.chars().filter(|c| !c.is_control()).collect();
    kept.trim().to_string()
}

#[test]
fn drain_lines_leaves_partial_tails() {
    let mut buf = b"one\r\ntwo\nthree".to_vec();
    let lines = drain_lines(&mut buf);
    assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    assert_eq!(buf, b"three".to_vec());

    buf.extend_from_slice(b" four\n");
    let lines = drain_lines(&mut buf);
    assert_eq!(lines, vec!["three four".to_string()]);
    assert!(buf.is_empty());
}

#[test]
fn drain_lines_handles_empty_lines() {
    let mut buf = b"\n\r\nx\n".to_vec();
    let lines = drain_lines(&mut buf);
    assert_eq!(lines, vec!["".to_string(), "".to_string(), "x".to_string()]);
}

#[test]
fn scrub_strips_control_characters() {
    assert_eq!(scrub("  hello\x1b[31m there\x07 "), "hello[31m there");
    assert_eq!(scrub("\t\r\n"), "");
    assert_eq!(scrub("plain"), "plain");
}
