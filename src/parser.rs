// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Script parser for macro files
//!
//! Parses scripts with the format:
//! - @ directives (name, loops, fallback, var)
//! - # comments
//! - `sequence <name>` headers
//! - one key, mouse or wait action per line, with trailing options
//!
//! Key combinations used for hotkeys are parsed here too.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{
        char, i32 as parse_i32, not_line_ending, one_of, space0, space1, u32 as parse_u32,
        u64 as parse_u64,
    },
    combinator::{all_consuming, map, opt, value},
    multi::{many0, separated_list1},
    sequence::preceded,
};

use crate::context::Value;
use crate::error::{Error, ValidationError};
use crate::hotkey::{KeyCombo, Modifiers};
use crate::recognition::{Region, Template};
use crate::script::Script;
use crate::types::{
    ActionHooks, DecisionPoint, FallbackPolicy, GameAction, KeyCode, KeyPhase, MouseButton,
    MousePhase, Trigger,
};

#[derive(Debug, Clone, PartialEq)]
enum Directive {
    Name(String),
    Loops(u32),
    Fallback(String),
    Var(String, String),
}

#[derive(Debug, Clone, PartialEq)]
enum ActionSpec<'a> {
    Key {
        phase: KeyPhase,
        key: &'a str,
    },
    Mouse {
        phase: MousePhase,
        button: Option<&'a str>,
        x: i32,
        y: i32,
    },
    Wait(u64),
}

#[derive(Debug, Clone, PartialEq)]
enum Opt<'a> {
    Gate {
        template: &'a str,
        region: Option<(i32, i32, u32, u32)>,
    },
    DecideAll,
    Rule(&'a str),
    Trigger {
        name: &'a str,
        require_progress: bool,
    },
    Description(&'a str),
}

#[derive(Debug, Clone, PartialEq)]
enum Line<'a> {
    Directive(Directive),
    Sequence(&'a str),
    Action {
        spec: ActionSpec<'a>,
        delay_ms: u64,
        opts: Vec<Opt<'a>>,
    },
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')(input)
}

fn parse_name(input: &str) -> IResult<&str, Directive> {
    let (input, _) = tag("name:")(input)?;
    let (input, name) = not_line_ending(input)?;
    Ok((input, Directive::Name(name.trim().to_string())))
}

fn parse_loops(input: &str) -> IResult<&str, Directive> {
    let (input, _) = tag("loops:")(input)?;
    let (input, _) = space0(input)?;
    let (input, loops) = parse_u32(input)?;
    Ok((input, Directive::Loops(loops)))
}

fn parse_fallback(input: &str) -> IResult<&str, Directive> {
    let (input, _) = tag("fallback:")(input)?;
    let (input, _) = space0(input)?;
    let (input, policy) = identifier(input)?;
    Ok((input, Directive::Fallback(policy.to_string())))
}

fn parse_var(input: &str) -> IResult<&str, Directive> {
    let (input, _) = tag("var:")(input)?;
    let (input, _) = space0(input)?;
    let (input, name) = identifier(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = char('=')(input)?;
    let (input, _) = space0(input)?;
    let (input, literal) = not_line_ending(input)?;
    Ok((
        input,
        Directive::Var(name.to_string(), literal.trim().to_string()),
    ))
}

fn parse_directive(input: &str) -> IResult<&str, Directive> {
    let (input, _) = char('@')(input)?;
    let (input, _) = space0(input)?;
    alt((parse_name, parse_loops, parse_fallback, parse_var)).parse(input)
}

fn parse_comment(input: &str) -> IResult<&str, ()> {
    let (input, _) = char('#')(input)?;
    let (input, _) = not_line_ending(input)?;
    Ok((input, ()))
}

fn parse_sequence(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag("sequence")(input)?;
    let (input, _) = space1(input)?;
    identifier(input)
}

fn parse_point(input: &str) -> IResult<&str, (i32, i32)> {
    let (input, x) = parse_i32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, y) = parse_i32(input)?;
    Ok((input, (x, y)))
}

fn parse_key(input: &str) -> IResult<&str, ActionSpec<'_>> {
    let (input, _) = tag("key")(input)?;
    let (input, _) = space1(input)?;
    let (input, phase) = alt((
        value(KeyPhase::Down, tag("down")),
        value(KeyPhase::Up, tag("up")),
    ))
    .parse(input)?;
    let (input, _) = space1(input)?;
    let (input, key) = take_till1(|c: char| c.is_whitespace())(input)?;
    Ok((input, ActionSpec::Key { phase, key }))
}

fn parse_mouse_move(input: &str) -> IResult<&str, ActionSpec<'_>> {
    let (input, _) = tag("move")(input)?;
    let (input, _) = space1(input)?;
    let (input, (x, y)) = parse_point(input)?;
    Ok((
        input,
        ActionSpec::Mouse {
            phase: MousePhase::Move,
            button: None,
            x,
            y,
        },
    ))
}

fn parse_mouse_button(input: &str) -> IResult<&str, ActionSpec<'_>> {
    let (input, phase) = alt((
        value(MousePhase::Down, tag("down")),
        value(MousePhase::Up, tag("up")),
    ))
    .parse(input)?;
    let (input, _) = space1(input)?;
    let (input, button) = take_till1(|c: char| c.is_whitespace())(input)?;
    let (input, _) = space1(input)?;
    let (input, (x, y)) = parse_point(input)?;
    Ok((
        input,
        ActionSpec::Mouse {
            phase,
            button: Some(button),
            x,
            y,
        },
    ))
}

fn parse_mouse(input: &str) -> IResult<&str, ActionSpec<'_>> {
    let (input, _) = tag("mouse")(input)?;
    let (input, _) = space1(input)?;
    alt((parse_mouse_move, parse_mouse_button)).parse(input)
}

fn parse_wait(input: &str) -> IResult<&str, ActionSpec<'_>> {
    let (input, _) = tag("wait")(input)?;
    let (input, _) = space1(input)?;
    let (input, ms) = parse_u64(input)?;
    let (input, _) = opt(tag("ms")).parse(input)?;
    Ok((input, ActionSpec::Wait(ms)))
}

fn parse_delay(input: &str) -> IResult<&str, u64> {
    let (input, _) = space1(input)?;
    let (input, _) = char('+')(input)?;
    let (input, ms) = parse_u64(input)?;
    let (input, _) = opt(tag("ms")).parse(input)?;
    Ok((input, ms))
}

fn parse_region(input: &str) -> IResult<&str, (i32, i32, u32, u32)> {
    let (input, _) = char('@')(input)?;
    let (input, (x, y)) = parse_point(input)?;
    let (input, _) = char(',')(input)?;
    let (input, w) = parse_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, h) = parse_u32(input)?;
    Ok((input, (x, y, w, h)))
}

fn parse_gate(input: &str) -> IResult<&str, Opt<'_>> {
    let (input, _) = char('?')(input)?;
    let (input, template) = take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')(input)?;
    let (input, region) = opt(parse_region).parse(input)?;
    Ok((input, Opt::Gate { template, region }))
}

fn parse_decision(input: &str) -> IResult<&str, Opt<'_>> {
    alt((
        map(preceded(tag("!rule:"), identifier), Opt::Rule),
        value(Opt::DecideAll, tag("!decide")),
    ))
    .parse(input)
}

fn parse_trigger(input: &str) -> IResult<&str, Opt<'_>> {
    alt((
        map(preceded(tag(">>"), identifier), |name| Opt::Trigger {
            name,
            require_progress: true,
        }),
        map(preceded(char('>'), identifier), |name| Opt::Trigger {
            name,
            require_progress: false,
        }),
    ))
    .parse(input)
}

fn parse_description(input: &str) -> IResult<&str, Opt<'_>> {
    let (input, _) = char('"')(input)?;
    let (input, text) = opt(take_till1(|c| c == '"')).parse(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, Opt::Description(text.unwrap_or(""))))
}

fn parse_option(input: &str) -> IResult<&str, Opt<'_>> {
    preceded(
        space1,
        alt((parse_gate, parse_decision, parse_trigger, parse_description)),
    )
    .parse(input)
}

fn parse_action(input: &str) -> IResult<&str, Line<'_>> {
    let (input, spec) = alt((parse_key, parse_mouse, parse_wait)).parse(input)?;
    let (input, delay_ms) = opt(parse_delay).parse(input)?;
    let (input, opts) = many0(parse_option).parse(input)?;
    Ok((
        input,
        Line::Action {
            spec,
            delay_ms: delay_ms.unwrap_or(0),
            opts,
        },
    ))
}

fn parse_line(input: &str) -> IResult<&str, Option<Line<'_>>> {
    alt((
        map(parse_directive, |d| Some(Line::Directive(d))),
        value(None, parse_comment),
        map(parse_sequence, |name| Some(Line::Sequence(name))),
        map(parse_action, Some),
    ))
    .parse(input)
}

fn build_action(spec: &ActionSpec<'_>, delay_ms: u64) -> Result<GameAction, ValidationError> {
    let delay_ms = i64::try_from(delay_ms).map_err(|_| ValidationError::OutOfRange {
        field: "delay",
        min: 0.0,
        max: i64::MAX as f64,
        value: delay_ms as f64,
    })?;

    match spec {
        ActionSpec::Key { phase, key } => {
            let code = KeyCode::from_name(key).ok_or_else(|| ValidationError::Unknown {
                kind: "key",
                name: key.to_string(),
            })?;
            GameAction::key(code, *phase, delay_ms)
        }
        ActionSpec::Mouse {
            phase,
            button,
            x,
            y,
        } => {
            let button = match button {
                Some(name) => name.parse::<MouseButton>()?,
                None => MouseButton::Left,
            };
            GameAction::mouse(button, *x, *y, *phase, delay_ms)
        }
        ActionSpec::Wait(ms) => {
            let ms = i64::try_from(*ms).unwrap_or(i64::MAX);
            GameAction::delay(ms.saturating_add(delay_ms))
        }
    }
}

fn build_hooks(
    mut action: GameAction,
    opts: &[Opt<'_>],
) -> Result<(GameAction, ActionHooks), ValidationError> {
    let mut hooks = ActionHooks::default();
    for opt in opts {
        match opt {
            Opt::Gate { template, region } => {
                let mut t = Template::new(template)?;
                if let Some((x, y, w, h)) = region {
                    t = t.within(Region::new(*x, *y, *w, *h)?);
                }
                hooks.gate = Some(t);
            }
            Opt::DecideAll => hooks.decision = Some(DecisionPoint::AllRules),
            Opt::Rule(name) => hooks.decision = Some(DecisionPoint::Rule(name.to_string())),
            Opt::Trigger {
                name,
                require_progress,
            } => {
                hooks.trigger = Some(Trigger {
                    name: name.to_string(),
                    require_progress: *require_progress,
                })
            }
            Opt::Description(text) => action = action.with_description(text)?,
        }
    }
    Ok((action, hooks))
}

fn line_error(line: usize, message: impl Into<String>) -> Error {
    Error::Parse {
        line,
        message: message.into(),
    }
}

/// Parse a script file into a Draft script. Errors carry the 1-based line.
pub fn parse_script(input: &str) -> Result<Script, Error> {
    let mut script = Script::new("untitled")?;
    let mut named = false;
    let mut current = 0usize;

    for (line_num, line) in input.lines().enumerate() {
        let line_no = line_num + 1;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }

        let parsed = match parse_line(trimmed) {
            Ok((remaining, parsed)) => {
                if !remaining.trim().is_empty() {
                    return Err(line_error(
                        line_no,
                        format!("unexpected text after command: '{}'", remaining.trim()),
                    ));
                }
                parsed
            }
            Err(e) => return Err(line_error(line_no, format!("parse error: {}", e))),
        };

        let at_line = |e: Error| match e {
            Error::Parse { .. } => e,
            other => line_error(line_no, other.to_string()),
        };

        match parsed {
            None => {}
            Some(Line::Directive(Directive::Name(name))) => {
                if named || script.action_count() > 0 || script.sequences().len() > 1 {
                    return Err(line_error(line_no, "@ name: must come before any action"));
                }
                script.rename(&name).map_err(at_line)?;
                named = true;
            }
            Some(Line::Directive(Directive::Loops(n))) => {
                script.set_loop_count(n).map_err(at_line)?;
            }
            Some(Line::Directive(Directive::Fallback(policy))) => {
                let policy = policy
                    .parse::<FallbackPolicy>()
                    .map_err(|e| at_line(e.into()))?;
                script.set_fallback(current, policy).map_err(at_line)?;
            }
            Some(Line::Directive(Directive::Var(name, literal))) => {
                script
                    .set_variable(&name, Value::parse_literal(&literal))
                    .map_err(at_line)?;
            }
            Some(Line::Sequence(name)) => {
                current = script.add_sequence(name).map_err(at_line)?;
            }
            Some(Line::Action {
                spec,
                delay_ms,
                opts,
            }) => {
                let action = build_action(&spec, delay_ms).map_err(|e| at_line(e.into()))?;
                let (action, hooks) =
                    build_hooks(action, &opts).map_err(|e| at_line(e.into()))?;
                if hooks.is_empty() {
                    script.add_action(current, action).map_err(at_line)?;
                } else {
                    script
                        .add_action_with_hooks(current, action, hooks)
                        .map_err(at_line)?;
                }
            }
        }
    }

    Ok(script)
}

fn modifier(part: &str, modifiers: &mut Modifiers) -> bool {
    match part {
        "C" | "c" | "Ctrl" | "ctrl" | "CTRL" | "Control" | "control" => modifiers.ctrl = true,
        "A" | "a" | "Alt" | "alt" | "ALT" | "M" | "m" | "Meta" | "meta" => modifiers.alt = true,
        "S" | "s" | "Shift" | "shift" | "SHIFT" => modifiers.shift = true,
        "W" | "w" | "Super" | "super" | "Cmd" | "cmd" | "Win" | "win" => {
            modifiers.super_key = true
        }
        _ => return false,
    }
    true
}

fn combo_parts(input: &str) -> IResult<&str, Vec<&str>> {
    all_consuming(separated_list1(
        one_of("+-"),
        take_while1(|c: char| c != '+' && c != '-' && !c.is_whitespace()),
    ))
    .parse(input)
}

/// Parse `C-S-p`, `Ctrl+Shift+P` and similar spellings.
pub fn parse_key_combo(spec: &str) -> Result<KeyCombo, ValidationError> {
    let (_, parts) = combo_parts(spec.trim())
        .map_err(|_| ValidationError::KeyCombo(format!("malformed combination '{}'", spec)))?;

    let Some((key, mods)) = parts.split_last() else {
        return Err(ValidationError::KeyCombo(format!("empty combination '{}'", spec)));
    };

    let mut modifiers = Modifiers::default();
    for part in mods {
        if !modifier(part, &mut modifiers) {
            return Err(ValidationError::KeyCombo(format!(
                "unknown modifier '{}' in '{}'",
                part, spec
            )));
        }
    }

    let key = KeyCode::from_name(key)
        .ok_or_else(|| ValidationError::KeyCombo(format!("unknown key '{}' in '{}'", key, spec)))?;
    KeyCombo::new(modifiers, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;

    #[test]
    fn test_parse_directive() {
        assert_eq!(
            parse_directive("@ loops:3").unwrap().1,
            Directive::Loops(3)
        );
        assert_eq!(
            parse_directive("@ var: hp = 20").unwrap().1,
            Directive::Var("hp".into(), "20".into())
        );
        assert_eq!(
            parse_directive("@ fallback: repeat-last").unwrap().1,
            Directive::Fallback("repeat-last".into())
        );
    }

    #[test]
    fn test_parse_key_with_delay() {
        let (rest, line) = parse_action("key down a +120").unwrap();
        assert!(rest.is_empty());
        assert_eq!(
            line,
            Line::Action {
                spec: ActionSpec::Key {
                    phase: KeyPhase::Down,
                    key: "a"
                },
                delay_ms: 120,
                opts: vec![],
            }
        );
    }

    #[test]
    fn test_parse_options() {
        let (_, line) =
            parse_action(r#"mouse down left 10,20 +50 ?ok_button@0,0,100,40 !rule:heal >>portal "click ok""#)
                .unwrap();
        let Line::Action { opts, .. } = line else {
            panic!("expected action");
        };
        assert_eq!(
            opts,
            vec![
                Opt::Gate {
                    template: "ok_button",
                    region: Some((0, 0, 100, 40))
                },
                Opt::Rule("heal"),
                Opt::Trigger {
                    name: "portal",
                    require_progress: true
                },
                Opt::Description("click ok"),
            ]
        );
    }

    #[test]
    fn test_parse_script() {
        let input = r#"@ name: Fight loop
@ loops: 2
@ var: hp = 80
# open the menu
key down esc +100
key up esc +30
mouse move 300,200 +10
mouse down left 300,200 +20 ?menu !decide
mouse up left 300,200 +40
wait 500

sequence heal
@ fallback: skip
key down h ?potion >healed
key up h +30
"#;
        let script = parse_script(input).unwrap();
        assert_eq!(script.name(), "Fight loop");
        assert_eq!(script.loop_count(), 2);
        assert_eq!(script.main().len(), 6);
        assert_eq!(script.main().total_delay_ms(), 700);

        let heal = script.sequence("heal").unwrap();
        assert_eq!(heal.len(), 2);
        assert_eq!(heal.fallback(), Some(FallbackPolicy::Skip));
        let hooks = heal.hooks(&heal.actions()[0].id()).unwrap();
        assert_eq!(hooks.gate.as_ref().map(|t| t.name()), Some("potion"));
        assert!(!hooks.trigger.as_ref().unwrap().require_progress);

        assert!(matches!(
            script.main().actions()[5].kind(),
            ActionKind::Delay
        ));
    }

    #[test]
    fn test_error_reports_line() {
        let input = "key down a\nkey sideways b\n";
        match parse_script(input) {
            Err(Error::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other.map(|s| s.version())),
        }

        let input = "# ok\n\nkey down nosuchkey\n";
        match parse_script(input) {
            Err(Error::Parse { line, message }) => {
                assert_eq!(line, 3);
                assert!(message.contains("nosuchkey"));
            }
            other => panic!("expected parse error, got {:?}", other.map(|s| s.version())),
        }
    }

    #[test]
    fn test_directives_before_name_are_kept() {
        let input = "@ loops: 5\n@ var: hp = 20\n@ fallback: skip\n@ name: Farm\nkey down a\n";
        let script = parse_script(input).unwrap();
        assert_eq!(script.name(), "Farm");
        assert_eq!(script.loop_count(), 5);
        assert_eq!(
            script.variables(),
            &[("hp".to_string(), Value::Number(20.0))]
        );
        assert_eq!(script.main().fallback(), Some(FallbackPolicy::Skip));

        assert!(matches!(
            parse_script("@ name: a\n@ name: b\n"),
            Err(Error::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_trailing_text_rejected() {
        assert!(matches!(
            parse_script("wait 100 oops"),
            Err(Error::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_parse_key_combo() {
        let combo = parse_key_combo("C-S-p").unwrap();
        assert!(combo.modifiers().ctrl);
        assert!(combo.modifiers().shift);
        assert_eq!(combo.key(), KeyCode::Char('p'));

        let combo = parse_key_combo("W+F12").unwrap();
        assert!(combo.modifiers().super_key);
        assert_eq!(combo.key(), KeyCode::F(12));

        assert!(parse_key_combo("Hyper+x").is_err());
        assert!(parse_key_combo("Ctrl+").is_err());
        assert!(parse_key_combo("").is_err());
    }
}
