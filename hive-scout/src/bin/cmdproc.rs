/**
 * CMDPROC SCOUT - Pont entre l'agent de langage naturel et le scout
 *
 * RÔLE : Invoqué par la plateforme avec --get (annonce du motif de
 * commande) ou --run (traduction d'une ligne opérateur en message bus,
 * imprimé sur stdout). Une ligne non reconnue ne produit rien.
 */
use hive_scout::cmdproc::{translate, BASE_CMD, HELP_LINES};

struct Args {
    get: bool,
    run: bool,
    original: String,
    sender: String,
    src: String,
}

fn parse_args() -> Args {
    let mut args = Args {
        get: false,
        run: false,
        original: String::new(),
        sender: String::new(),
        src: String::new(),
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--get" => args.get = true,
            "--run" => args.run = true,
            "--original" => args.original = iter.next().unwrap_or_default(),
            "--msg-sender-uniqueid" => args.sender = iter.next().unwrap_or_default(),
            "--msg-src" => args.src = iter.next().unwrap_or_default(),
            _ => {}
        }
    }

    args
}

fn main() {
    let args = parse_args();

    if args.get {
        println!("scout help");
        // Le motif ne doit pas se terminer par un saut de ligne
        print!("/{BASE_CMD}/");
        return;
    }

    if args.run {
        if args.original == "scout help" {
            for line in HELP_LINES {
                println!("feedback {line}");
            }
            return;
        }

        if let Some(cmd) = translate(&args.original, &args.sender, &args.src) {
            println!("{cmd}");
        }
    }
}
