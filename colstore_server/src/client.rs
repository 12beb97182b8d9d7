use std::error::Error;
use std::io::{self, Write};

use colstore_core::key::{self, Cell};
use colstore_core::{ClientError, ClusterClient, RowAddress};

/// One client command, from the command line or a shell line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create {
        table: String,
        partition_key_names: Vec<String>,
        clustering_key_names: Vec<String>,
    },
    Read {
        table: String,
        partition_keys: Vec<String>,
        clustering_keys: Vec<String>,
    },
    Insert {
        table: String,
        partition_keys: Vec<String>,
        clustering_keys: Vec<String>,
        cells: Vec<Cell>,
    },
    Delete {
        table: String,
        partition_keys: Vec<String>,
        clustering_keys: Vec<String>,
    },
    Repair,
    FullRepair,
}

/// Run one request and render its outcome for the terminal
pub async fn execute(client: &ClusterClient, request: &Request) -> Result<String, ClientError> {
    match request {
        Request::Create {
            table,
            partition_key_names,
            clustering_key_names,
        } => Ok(client
            .create(table, partition_key_names, clustering_key_names)
            .await?
            .message),
        Request::Read {
            table,
            partition_keys,
            clustering_keys,
        } => {
            let cells = client.read(table, partition_keys, clustering_keys).await?;
            Ok(render_cells(&cells))
        }
        Request::Insert {
            table,
            partition_keys,
            clustering_keys,
            cells,
        } => {
            let address = RowAddress::new(table, partition_keys, clustering_keys)?;
            Ok(client.insert(&address, cells).await?.message)
        }
        Request::Delete {
            table,
            partition_keys,
            clustering_keys,
        } => {
            let address = RowAddress::new(table, partition_keys, clustering_keys)?;
            Ok(client.delete(&address).await?.message)
        }
        Request::Repair => Ok(client.repair().await?.message),
        Request::FullRepair => Ok(client.full_repair().await?.message),
    }
}

fn render_cells(cells: &[Cell]) -> String {
    if cells.is_empty() {
        return "(empty)".to_string();
    }
    cells
        .iter()
        .map(|cell| format!("{} = {}", cell.name, cell.value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse one `name=value` cell; the value is everything after the first `=`
pub fn parse_cell(raw: &str) -> Result<Cell, String> {
    match raw.split_once('=') {
        Some((name, value)) => Ok(Cell::new(name, value)),
        None => Err(format!("expected name=value, got '{}'", raw)),
    }
}

/// Split a line on whitespace, keeping double-quoted text together.
///
/// Inside quotes `\"` and `\\` stand for a quote and a backslash.
pub fn split_words(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err("unterminated quote".to_string()),
                        },
                        Some(other) => current.push(other),
                        None => return Err("unterminated quote".to_string()),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Parse a shell line such as `INSERT patients H1 R2 temp=98.6 note="room 7"`.
///
/// Multi-component keys are joined with `delimiter`; each cell is one
/// `name=value` word and may be quoted to hold spaces.
pub fn parse_line(line: &str, delimiter: &str) -> Result<Request, String> {
    let tokens = split_words(line)?;
    let words: Vec<&str> = tokens.iter().map(String::as_str).collect();
    let Some((verb, args)) = words.split_first() else {
        return Err("empty command".to_string());
    };
    let split = |raw: &str| key::split_components(raw, delimiter);

    match (verb.to_uppercase().as_str(), args) {
        ("CREATE", &[table, partition, clustering]) => Ok(Request::Create {
            table: table.to_string(),
            partition_key_names: split(partition),
            clustering_key_names: split(clustering),
        }),
        ("READ", &[table, partition, clustering]) => Ok(Request::Read {
            table: table.to_string(),
            partition_keys: split(partition),
            clustering_keys: split(clustering),
        }),
        ("INSERT", &[table, partition, clustering, ref cells @ ..]) if !cells.is_empty() => Ok(Request::Insert {
            table: table.to_string(),
            partition_keys: split(partition),
            clustering_keys: split(clustering),
            cells: cells.iter().map(|raw| parse_cell(raw)).collect::<Result<_, _>>()?,
        }),
        ("DELETE", &[table, partition, clustering]) => Ok(Request::Delete {
            table: table.to_string(),
            partition_keys: split(partition),
            clustering_keys: split(clustering),
        }),
        ("REPAIR", []) => Ok(Request::Repair),
        ("FULL_REPAIR", []) | ("FULL-REPAIR", []) => Ok(Request::FullRepair),
        ("CREATE" | "READ" | "DELETE" | "INSERT" | "REPAIR" | "FULL_REPAIR" | "FULL-REPAIR", _) => {
            Err(format!("wrong number of arguments for {}", verb.to_uppercase()))
        }
        (other, _) => Err(format!("unknown command '{}'", other)),
    }
}

/// Interactive shell against the cluster
pub async fn run_shell(client: ClusterClient, delimiter: String) -> Result<(), Box<dyn Error>> {
    let topology = client.router().snapshot().await;
    println!(
        "Connected to {} node(s). Type HELP for commands, QUIT to exit.",
        topology.len()
    );

    let mut line = String::new();
    loop {
        print!("colstore> ");
        io::stdout().flush()?;

        line.clear();
        let bytes_read = io::stdin().read_line(&mut line)?;
        if bytes_read == 0 {
            break;
        }

        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        match command.to_uppercase().as_str() {
            "QUIT" | "EXIT" => break,
            "HELP" => {
                print_help(&delimiter);
                continue;
            }
            "STATS" => {
                println!("{}", client.metrics());
                continue;
            }
            _ => {}
        }

        match parse_line(command, &delimiter) {
            Ok(request) => match execute(&client, &request).await {
                Ok(output) => println!("{}", output),
                Err(e) => println!("ERROR ({}): {}", e.kind(), e),
            },
            Err(e) => println!("ERROR: {}", e),
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn print_help(delimiter: &str) {
    println!("Commands (join multiple key components with '{}'):", delimiter);
    println!("  CREATE <table> <partition_key_names> <clustering_key_names>");
    println!("  READ <table> <partition_keys> <clustering_keys>");
    println!("  INSERT <table> <partition_keys> <clustering_keys> <name=value>... (quote values with spaces)");
    println!("  DELETE <table> <partition_keys> <clustering_keys>");
    println!("  REPAIR");
    println!("  FULL_REPAIR");
    println!("  STATS");
    println!("  QUIT");
}
