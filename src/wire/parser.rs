use super::protocol::{Command, Response};

const MAX_TUBE_NAME: usize = 200;

/// Parses a single `\r\n`-delimited command line (CRLF already stripped) into
/// a [`Command`]. This is the contract `wire::decoder::Decoder` depends on:
/// unrecognised tokens and malformed arguments both resynchronise the
/// framer via a `Response` error.
impl TryFrom<&[u8]> for Command {
    type Error = Response;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        let (token, rest) = split_first(line);

        match token {
            b"put" => parse_put(rest),
            b"reserve" => expect_empty(rest, Command::Reserve),
            b"reserve-with-timeout" => Ok(Command::ReserveWithTimeout {
                timeout: parse_u32(rest)?,
            }),
            b"reserve-job" => Ok(Command::ReserveJob { id: parse_u64(rest)? }),
            b"release" => parse_release(rest),
            b"delete" => Ok(Command::Delete { id: parse_u64(rest)? }),
            b"bury" => parse_bury(rest),
            b"touch" => Ok(Command::Touch { id: parse_u64(rest)? }),
            b"watch" => Ok(Command::Watch { tube: parse_tube(rest)? }),
            b"ignore" => Ok(Command::Ignore { tube: parse_tube(rest)? }),
            b"peek" => Ok(Command::Peek { id: parse_u64(rest)? }),
            b"peek-ready" => expect_empty(rest, Command::PeekReady),
            b"peek-delayed" => expect_empty(rest, Command::PeekDelayed),
            b"peek-buried" => expect_empty(rest, Command::PeekBuried),
            b"kick" => Ok(Command::Kick { bound: parse_u64(rest)? }),
            b"kick-job" => Ok(Command::KickJob { id: parse_u64(rest)? }),
            b"stats-job" => Ok(Command::StatsJob { id: parse_u64(rest)? }),
            b"stats-tube" => Ok(Command::StatsTube { tube: parse_tube(rest)? }),
            b"stats" => expect_empty(rest, Command::StatsServer),
            b"list-tubes" => expect_empty(rest, Command::ListTubes),
            b"list-tubes-used" => expect_empty(rest, Command::ListTubesUsed),
            b"list-tubes-watched" => expect_empty(rest, Command::ListTubesWatched),
            b"quit" => expect_empty(rest, Command::Quit),
            b"pause-tube" => parse_pause_tube(rest),
            b"use" => Ok(Command::Use { tube: parse_tube(rest)? }),
            _ => Err(Response::UnknownCommand),
        }
    }
}

/// Splits `line` at the first space into `(token, rest)`. `rest` is empty
/// when there was no space.
fn split_first(line: &[u8]) -> (&[u8], &[u8]) {
    match line.iter().position(|&b| b == b' ') {
        Some(idx) => (&line[..idx], &line[idx + 1..]),
        None => (line, b""),
    }
}

fn words(rest: &[u8]) -> Vec<&[u8]> {
    rest.split(|&b| b == b' ').filter(|w| !w.is_empty()).collect()
}

fn expect_empty(rest: &[u8], cmd: Command) -> Result<Command, Response> {
    if rest.is_empty() {
        Ok(cmd)
    } else {
        Err(Response::BadFormat)
    }
}

fn parse_u32(field: &[u8]) -> Result<u32, Response> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(Response::BadFormat)
}

fn parse_u64(field: &[u8]) -> Result<u64, Response> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(Response::BadFormat)
}

fn parse_tube(field: &[u8]) -> Result<Vec<u8>, Response> {
    if field.is_empty() || field.len() > MAX_TUBE_NAME {
        return Err(Response::BadFormat);
    }

    let valid = field.iter().all(|&b| {
        b.is_ascii_alphanumeric()
            || matches!(b, b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' | b'-')
    });

    if valid {
        Ok(field.to_vec())
    } else {
        Err(Response::BadFormat)
    }
}

fn parse_put(rest: &[u8]) -> Result<Command, Response> {
    let w = words(rest);
    let [pri, delay, ttr, n_bytes] = w[..] else {
        return Err(Response::BadFormat);
    };

    Ok(Command::Put {
        pri: parse_u32(pri)?,
        delay: parse_u32(delay)?,
        ttr: parse_u32(ttr)?,
        n_bytes: parse_u32(n_bytes)?,
    })
}

fn parse_release(rest: &[u8]) -> Result<Command, Response> {
    let w = words(rest);
    let [id, pri, delay] = w[..] else {
        return Err(Response::BadFormat);
    };

    Ok(Command::Release {
        id: parse_u64(id)?,
        pri: parse_u32(pri)?,
        delay: parse_u32(delay)?,
    })
}

fn parse_bury(rest: &[u8]) -> Result<Command, Response> {
    let w = words(rest);
    let [id, pri] = w[..] else {
        return Err(Response::BadFormat);
    };

    Ok(Command::Bury {
        id: parse_u64(id)?,
        pri: parse_u32(pri)?,
    })
}

fn parse_pause_tube(rest: &[u8]) -> Result<Command, Response> {
    let w = words(rest);
    let [tube, delay] = w[..] else {
        return Err(Response::BadFormat);
    };

    Ok(Command::PauseTube {
        tube: parse_tube(tube)?,
        delay: parse_u32(delay)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put_header() {
        let cmd: Command = b"put 10 0 60 5".as_slice().try_into().unwrap();
        assert_eq!(
            cmd,
            Command::Put { pri: 10, delay: 0, ttr: 60, n_bytes: 5 }
        );
    }

    #[test]
    fn parses_reserve() {
        let cmd: Command = b"reserve".as_slice().try_into().unwrap();
        assert_eq!(cmd, Command::Reserve);
    }

    #[test]
    fn rejects_reserve_with_trailing_garbage() {
        let err = Command::try_from(b"reserve now".as_slice()).unwrap_err();
        assert_eq!(err, Response::BadFormat);
    }

    #[test]
    fn parses_watch_and_ignore() {
        assert_eq!(
            Command::try_from(b"watch foo".as_slice()).unwrap(),
            Command::Watch { tube: b"foo".to_vec() }
        );
        assert_eq!(
            Command::try_from(b"ignore foo".as_slice()).unwrap(),
            Command::Ignore { tube: b"foo".to_vec() }
        );
    }

    #[test]
    fn rejects_oversize_tube_name() {
        let name = vec![b'a'; 201];
        let mut line = b"use ".to_vec();
        line.extend(name);
        assert_eq!(Command::try_from(line.as_slice()).unwrap_err(), Response::BadFormat);
    }

    #[test]
    fn rejects_invalid_tube_charset() {
        assert_eq!(
            Command::try_from(b"use foo bar".as_slice()).unwrap_err(),
            Response::BadFormat
        );
    }

    #[test]
    fn unknown_token_is_unknown_command() {
        assert_eq!(
            Command::try_from(b"frobnicate".as_slice()).unwrap_err(),
            Response::UnknownCommand
        );
    }

    #[test]
    fn parses_delete_release_touch() {
        assert_eq!(
            Command::try_from(b"delete 42".as_slice()).unwrap(),
            Command::Delete { id: 42 }
        );
        assert_eq!(
            Command::try_from(b"release 42 10 5".as_slice()).unwrap(),
            Command::Release { id: 42, pri: 10, delay: 5 }
        );
        assert_eq!(
            Command::try_from(b"touch 42".as_slice()).unwrap(),
            Command::Touch { id: 42 }
        );
    }
}
