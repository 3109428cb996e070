//! Command-line parsing.

use anyhow::{bail, Context, Result};

use roomchat_shared::{ChannelCode, UserId};

pub const USAGE: &str = "\
usage: roomchat <command> [args]

commands:
  register <user> [display name]   create or update a user
  login <user>                     sign in on this device
  logout                           forget the signed-in user
  whoami                           show the signed-in user and open room
  users                            list every user with presence
  peers                            conversation list for the signed-in user
  send <peer> <text...>            send a message to <peer>
  history <peer> [limit]           print the latest messages with <peer>
  summary                          unread summary for the signed-in user
  watch <peer>                     open the conversation and stream it until Ctrl+C
  channels                         list every group channel
  channel create <max> <name...>   create a channel for up to <max> members
  channel join <code>              join the channel with a 4-digit code
  channel leave                    leave the current channel
  channel members                  list members of the current channel
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register {
        user: UserId,
        display_name: Option<String>,
    },
    Login(UserId),
    Logout,
    WhoAmI,
    Users,
    Peers,
    Send {
        peer: UserId,
        text: String,
    },
    History {
        peer: UserId,
        limit: Option<u32>,
    },
    Summary,
    Watch(UserId),
    Channels,
    ChannelCreate {
        name: String,
        max_members: u32,
    },
    ChannelJoin(ChannelCode),
    ChannelLeave,
    ChannelMembers,
}

impl Command {
    pub fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            bail!("missing command\n\n{USAGE}");
        };

        let command = match name.as_str() {
            "register" => Command::Register {
                user: user_arg(rest.first())?,
                display_name: (rest.len() > 1).then(|| rest[1..].join(" ")),
            },
            "login" => Command::Login(user_arg(rest.first())?),
            "logout" => Command::Logout,
            "whoami" => Command::WhoAmI,
            "users" => Command::Users,
            "peers" => Command::Peers,
            "send" => {
                let peer = user_arg(rest.first())?;
                if rest.len() < 2 {
                    bail!("send needs a message text");
                }
                Command::Send {
                    peer,
                    text: rest[1..].join(" "),
                }
            }
            "history" => Command::History {
                peer: user_arg(rest.first())?,
                limit: rest
                    .get(1)
                    .map(|l| l.parse::<u32>().context("limit must be a positive number"))
                    .transpose()?,
            },
            "summary" => Command::Summary,
            "watch" => Command::Watch(user_arg(rest.first())?),
            "channels" => Command::Channels,
            "channel" => channel_command(rest)?,
            other => bail!("unknown command {other:?}\n\n{USAGE}"),
        };
        Ok(command)
    }

    /// Whether the command acts on behalf of a signed-in user.
    pub fn needs_session(&self) -> bool {
        matches!(
            self,
            Command::Peers
                | Command::Send { .. }
                | Command::History { .. }
                | Command::Summary
                | Command::Watch(_)
                | Command::ChannelCreate { .. }
                | Command::ChannelJoin(_)
                | Command::ChannelLeave
                | Command::ChannelMembers
        )
    }
}

fn channel_command(rest: &[String]) -> Result<Command> {
    let Some((action, rest)) = rest.split_first() else {
        bail!("channel needs one of: create, join, leave, members");
    };
    let command = match action.as_str() {
        "create" => {
            let max_members = rest
                .first()
                .context("missing member limit")?
                .parse::<u32>()
                .context("member limit must be a number")?;
            if rest.len() < 2 {
                bail!("channel create needs a name");
            }
            Command::ChannelCreate {
                name: rest[1..].join(" "),
                max_members,
            }
        }
        "join" => {
            let raw = rest.first().context("missing channel code")?;
            Command::ChannelJoin(
                ChannelCode::parse(raw.as_str()).with_context(|| format!("invalid code {raw:?}"))?,
            )
        }
        "leave" => Command::ChannelLeave,
        "members" => Command::ChannelMembers,
        other => bail!("unknown channel action {other:?}"),
    };
    Ok(command)
}

fn user_arg(arg: Option<&String>) -> Result<UserId> {
    let raw = arg.context("missing user id")?;
    UserId::parse(raw.as_str()).with_context(|| format!("invalid user id {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_parse_send_joins_text() {
        let cmd = Command::parse(&args("send bob hello there")).unwrap();
        assert_eq!(
            cmd,
            Command::Send {
                peer: UserId::parse("bob").unwrap(),
                text: "hello there".into()
            }
        );
        assert!(cmd.needs_session());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse(&[]).is_err());
        assert!(Command::parse(&args("send bob")).is_err());
        assert!(Command::parse(&args("login bad_id")).is_err());
        assert!(Command::parse(&args("history bob many")).is_err());
        assert!(Command::parse(&args("dance")).is_err());
    }

    #[test]
    fn test_parse_register_with_display_name() {
        let cmd = Command::parse(&args("register alice Alice Liddell")).unwrap();
        assert_eq!(
            cmd,
            Command::Register {
                user: UserId::parse("alice").unwrap(),
                display_name: Some("Alice Liddell".into()),
            }
        );
        assert!(!cmd.needs_session());
    }

    #[test]
    fn test_parse_channel_commands() {
        let cmd = Command::parse(&args("channel create 5 book club")).unwrap();
        assert_eq!(
            cmd,
            Command::ChannelCreate {
                name: "book club".into(),
                max_members: 5,
            }
        );
        assert!(cmd.needs_session());
        assert_eq!(
            Command::parse(&args("channel join 0427")).unwrap(),
            Command::ChannelJoin(ChannelCode::parse("0427").unwrap())
        );
        assert!(!Command::parse(&args("channels")).unwrap().needs_session());

        assert!(Command::parse(&args("channel")).is_err());
        assert!(Command::parse(&args("channel join 12a4")).is_err());
        assert!(Command::parse(&args("channel create five club")).is_err());
        assert!(Command::parse(&args("channel create 5")).is_err());
    }
}
