/**
 * HIVE SCOUT - Contrôleur de migration d'agents
 *
 * RÔLE : Surveille la charge des agents de la plateforme et les déplace
 * entre le serveur central et les outposts distants, sans perdre leur
 * état mémoire ni les messages qui leur sont adressés pendant le voyage.
 */
pub mod balance;
pub mod book;
pub mod bus;
pub mod cmdproc;
pub mod config;
pub mod controller;
pub mod messages;
pub mod migrate;
pub mod paths;
pub mod rules;
pub mod transport;
