use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("placeholder %{index} at byte {position} has no argument ({count} given)")]
    MissingArgument {
        index: usize,
        position: usize,
        count: usize,
    },
    #[error("malformed placeholder at byte {position}")]
    Malformed { position: usize },
}

fn walk<'a>(
    template: &'a str,
    args: &[&'a str],
    mut sink: impl FnMut(&'a str),
) -> Result<(), TemplateError> {
    let bytes = template.as_bytes();
    let mut literal_start = 0;
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b'\'' => {
                sink(&template[literal_start..pos]);
                sink("\"");
                pos += 1;
                literal_start = pos;
            }
            b'%' => {
                sink(&template[literal_start..pos]);
                match bytes.get(pos + 1).copied() {
                    Some(b'%') => sink("%"),
                    Some(digit @ b'1'..=b'9') => {
                        let index = usize::from(digit - b'0');
                        let arg = args.get(index - 1).ok_or(TemplateError::MissingArgument {
                            index,
                            position: pos,
                            count: args.len(),
                        })?;
                        sink(*arg);
                    }
                    _ => return Err(TemplateError::Malformed { position: pos }),
                }
                pos += 2;
                literal_start = pos;
            }
            _ => pos += 1,
        }
    }
    sink(&template[literal_start..]);
    Ok(())
}

/// Exact byte length of the expansion.
pub fn measure(template: &str, args: &[&str]) -> Result<usize, TemplateError> {
    let mut len = 0;
    walk(template, args, |part| len += part.len())?;
    Ok(len)
}

/// Expands into a buffer allocated once at the measured size.
pub fn expand(template: &str, args: &[&str]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(measure(template, args)?);
    walk(template, args, |part| out.push_str(part))?;
    Ok(out)
}
